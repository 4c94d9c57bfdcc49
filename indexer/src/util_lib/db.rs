// Copyright (C) 2013-2020 Blockstack PBC, a public benefit corporation
// Copyright (C) 2020 Stacks Open Internet Foundation
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::io::Error as IOError;
use std::path::Path;
use std::{error, fmt, fs};

use indexer_common::types::chainstate::{
    BlockHeaderHash, BurnchainHeaderHash, StacksBlockId, Txid,
};
use indexer_common::types::StacksAddress;
pub use indexer_common::util::db::tx_busy_handler;
use indexer_common::util::db::update_lock_table;
use rusqlite::{
    params, Connection, Error as sqlite_error, ErrorCode, OpenFlags, OptionalExtension, Params,
    Row, Transaction, TransactionBehavior,
};
use serde_json::Error as serde_error;

pub type DBConn = rusqlite::Connection;
pub type DBTx<'a> = rusqlite::Transaction<'a>;

/// Path that opens a private in-memory database.
pub const MEMORY_DB_PATH: &str = ":memory:";

#[derive(Debug)]
pub enum Error {
    /// Database doesn't exist
    NoDBError,
    /// Read-only and tried to write
    ReadOnly,
    /// Type error -- can't represent the given data in the database
    TypeError,
    /// Database is corrupt -- we got data that shouldn't be there, or didn't get data when we
    /// should have
    Corruption,
    /// Serialization error -- can't serialize data
    SerializationError(serde_error),
    /// Parse error -- failed to load data we stored directly
    ParseError,
    /// Operation would overflow
    Overflow,
    /// Data not found
    NotFoundError,
    /// Data already exists
    ExistsError,
    /// Sqlite3 error
    SqliteError(sqlite_error),
    /// I/O error
    IOError(IOError),
    /// Other error
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::NoDBError => write!(f, "Database does not exist"),
            Error::ReadOnly => write!(f, "Database is opened read-only"),
            Error::TypeError => write!(f, "Invalid or unrepresentable database type"),
            Error::Corruption => write!(f, "Database is corrupt"),
            Error::SerializationError(ref e) => fmt::Display::fmt(e, f),
            Error::ParseError => write!(f, "Parse error"),
            Error::Overflow => write!(f, "Numeric overflow"),
            Error::NotFoundError => write!(f, "Not found"),
            Error::ExistsError => write!(f, "Already exists"),
            Error::IOError(ref e) => fmt::Display::fmt(e, f),
            Error::SqliteError(ref e) => fmt::Display::fmt(e, f),
            Error::Other(ref s) => fmt::Display::fmt(s, f),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::SerializationError(ref e) => Some(e),
            Error::SqliteError(ref e) => Some(e),
            Error::IOError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlite_error> for Error {
    fn from(e: sqlite_error) -> Error {
        Error::SqliteError(e)
    }
}

impl From<serde_error> for Error {
    fn from(e: serde_error) -> Error {
        Error::SerializationError(e)
    }
}

impl Error {
    /// Would the same operation plausibly succeed if retried later?
    /// Lock contention and I/O trouble are; constraint violations and bad data are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::IOError(_) => true,
            Error::SqliteError(sqlite_error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::CannotOpen
                    | ErrorCode::OutOfMemory
            ),
            _ => false,
        }
    }
}

pub trait FromRow<T> {
    fn from_row(row: &Row) -> Result<T, Error>;
}

pub trait FromColumn<T> {
    fn from_column(row: &Row, column_name: &str) -> Result<T, Error>;
}

impl FromRow<u64> for u64 {
    fn from_row(row: &Row) -> Result<u64, Error> {
        let x: i64 = row.get(0)?;
        if x < 0 {
            return Err(Error::ParseError);
        }
        Ok(x as u64)
    }
}

impl FromColumn<u64> for u64 {
    fn from_column(row: &Row, column_name: &str) -> Result<u64, Error> {
        let x: i64 = row.get(column_name)?;
        if x < 0 {
            return Err(Error::ParseError);
        }
        Ok(x as u64)
    }
}

impl FromColumn<Option<u64>> for u64 {
    fn from_column(row: &Row, column_name: &str) -> Result<Option<u64>, Error> {
        let x: Option<i64> = row.get(column_name)?;
        match x {
            Some(x) if x < 0 => Err(Error::ParseError),
            Some(x) => Ok(Some(x as u64)),
            None => Ok(None),
        }
    }
}

impl FromRow<i64> for i64 {
    fn from_row(row: &Row) -> Result<i64, Error> {
        let x: i64 = row.get(0)?;
        Ok(x)
    }
}

impl FromRow<String> for String {
    fn from_row(row: &Row) -> Result<String, Error> {
        let x: String = row.get(0)?;
        Ok(x)
    }
}

impl FromColumn<StacksAddress> for StacksAddress {
    fn from_column(row: &Row, column_name: &str) -> Result<StacksAddress, Error> {
        let addr: String = row.get(column_name)?;
        addr.parse().map_err(|_| Error::ParseError)
    }
}

impl FromColumn<Option<StacksAddress>> for StacksAddress {
    fn from_column(row: &Row, column_name: &str) -> Result<Option<StacksAddress>, Error> {
        let addr: Option<String> = row.get(column_name)?;
        match addr {
            Some(addr) => Ok(Some(addr.parse().map_err(|_| Error::ParseError)?)),
            None => Ok(None),
        }
    }
}

macro_rules! impl_byte_array_from_column_only {
    ($thing:ident) => {
        impl FromColumn<$thing> for $thing {
            fn from_column(row: &Row, column_name: &str) -> Result<Self, Error> {
                Ok(row.get::<_, Self>(column_name)?)
            }
        }

        impl FromColumn<Option<$thing>> for $thing {
            fn from_column(row: &Row, column_name: &str) -> Result<Option<Self>, Error> {
                Ok(row.get::<_, Option<Self>>(column_name)?)
            }
        }

        impl FromRow<$thing> for $thing {
            fn from_row(row: &Row) -> Result<Self, Error> {
                Ok(row.get::<_, Self>(0)?)
            }
        }
    };
}

impl_byte_array_from_column_only!(StacksBlockId);
impl_byte_array_from_column_only!(BlockHeaderHash);
impl_byte_array_from_column_only!(BurnchainHeaderHash);
impl_byte_array_from_column_only!(Txid);

pub fn u64_to_sql(x: u64) -> Result<i64, Error> {
    if x > (i64::MAX as u64) {
        return Err(Error::ParseError);
    }
    Ok(x as i64)
}

pub fn opt_u64_to_sql(x: Option<u64>) -> Result<Option<i64>, Error> {
    x.map(u64_to_sql).transpose()
}

/// boilerplate code for querying rows
pub fn query_rows<T, P>(conn: &Connection, sql_query: &str, sql_args: P) -> Result<Vec<T>, Error>
where
    P: Params,
    T: FromRow<T>,
{
    let mut stmt = conn.prepare(sql_query)?;
    let result = stmt.query_and_then(sql_args, |row| T::from_row(row))?;

    result.collect()
}

/// boilerplate code for querying a single row
///   if more than 1 row is returned, excess rows are ignored.
pub fn query_row<T, P>(conn: &Connection, sql_query: &str, sql_args: P) -> Result<Option<T>, Error>
where
    P: Params,
    T: FromRow<T>,
{
    let query_result = conn.query_row_and_then(sql_query, sql_args, |row| T::from_row(row));
    match query_result {
        Ok(x) => Ok(Some(x)),
        Err(Error::SqliteError(sqlite_error::QueryReturnedNoRows)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Boilerplate for querying a single integer (first and only item of the query must be an int)
pub fn query_int<P>(conn: &Connection, sql_query: &str, sql_args: P) -> Result<i64, Error>
where
    P: Params,
{
    let mut stmt = conn.prepare(sql_query)?;
    let mut rows = stmt.query(sql_args)?;

    let Some(row) = rows.next()? else {
        return Err(Error::NotFoundError);
    };
    let i: i64 = row.get(0)?;
    if rows.next()?.is_some() {
        return Err(Error::Overflow);
    }
    Ok(i)
}

pub fn query_count<P>(conn: &Connection, sql_query: &str, sql_args: P) -> Result<u64, Error>
where
    P: Params,
{
    let count = query_int(conn, sql_query, sql_args)?;
    u64::try_from(count).map_err(|_| Error::ParseError)
}

/// Returns true if the database table `table_name` exists in the active
///  database of the provided SQLite connection.
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, sqlite_error> {
    let sql = "SELECT name FROM sqlite_master WHERE type='table' AND name=?";
    conn.query_row(sql, params![table_name], |row| row.get::<_, String>(0))
        .optional()
        .map(|r| r.is_some())
}

/// Open a database connection and set some typically-used pragmas.
/// File-backed databases run in WAL mode so that readers see a consistent
/// snapshot while the writer holds its transaction open.
pub fn sqlite_open<P: AsRef<Path>>(
    path: P,
    flags: OpenFlags,
    foreign_keys: bool,
) -> Result<Connection, sqlite_error> {
    let db = Connection::open_with_flags(path.as_ref(), flags)?;
    db.busy_handler(Some(tx_busy_handler))?;
    let in_memory = path.as_ref().to_str() == Some(MEMORY_DB_PATH);
    if !in_memory && !flags.contains(OpenFlags::SQLITE_OPEN_READ_ONLY) {
        // journal_mode reports the new mode back as a row
        db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        db.pragma_update(None, "synchronous", "NORMAL")?;
    }
    if foreign_keys {
        db.pragma_update(None, "foreign_keys", true)?;
    }
    Ok(db)
}

/// Does the database file at `path` exist yet?
pub fn db_exists(path: &str) -> bool {
    path != MEMORY_DB_PATH && fs::metadata(path).is_ok()
}

/// Begin an immediate-mode transaction, and handle busy errors with exponential backoff.
/// Handling busy errors when the tx begins is preferable to doing it when the tx commits, since
/// then we don't have to worry about any extra rollback logic.
pub fn tx_begin_immediate(conn: &mut Connection) -> Result<DBTx<'_>, Error> {
    conn.busy_handler(Some(tx_busy_handler))?;
    let tx = Transaction::new(conn, TransactionBehavior::Immediate)?;
    update_lock_table(&tx);
    Ok(tx)
}

/// Run `f` inside a named savepoint of the enclosing transaction.  On success the savepoint is
/// released; on failure only the work done by `f` is rolled back, and the enclosing
/// transaction stays usable.
pub fn with_savepoint<T, E, F>(conn: &Connection, name: &str, f: F) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E>,
    E: From<Error>,
{
    conn.execute_batch(&format!("SAVEPOINT {name};"))
        .map_err(Error::from)?;
    match f(conn) {
        Ok(v) => {
            conn.execute_batch(&format!("RELEASE {name};"))
                .map_err(Error::from)?;
            Ok(v)
        }
        Err(e) => {
            conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name};"))
                .map_err(Error::from)?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> DBConn {
        let conn = sqlite_open(
            MEMORY_DB_PATH,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            false,
        )
        .unwrap();
        conn.execute_batch("CREATE TABLE t(k TEXT PRIMARY KEY, v INTEGER NOT NULL);")
            .unwrap();
        conn
    }

    #[test]
    fn test_query_helpers() {
        let conn = test_conn();
        assert!(table_exists(&conn, "t").unwrap());
        assert!(!table_exists(&conn, "nope").unwrap());

        conn.execute("INSERT INTO t (k, v) VALUES ('a', 1), ('b', 2)", [])
            .unwrap();
        let vs: Vec<u64> = query_rows(&conn, "SELECT v FROM t ORDER BY v", []).unwrap();
        assert_eq!(vs, vec![1, 2]);

        let none: Option<u64> = query_row(&conn, "SELECT v FROM t WHERE k = 'z'", []).unwrap();
        assert!(none.is_none());

        assert_eq!(query_count(&conn, "SELECT COUNT(*) FROM t", []).unwrap(), 2);
        assert!(matches!(
            query_int(&conn, "SELECT v FROM t", []),
            Err(Error::Overflow)
        ));
        assert!(matches!(
            query_int(&conn, "SELECT v FROM t WHERE k = 'z'", []),
            Err(Error::NotFoundError)
        ));
    }

    #[test]
    fn test_savepoint_rolls_back_only_inner_work() {
        let mut conn = test_conn();
        let tx = tx_begin_immediate(&mut conn).unwrap();
        tx.execute("INSERT INTO t (k, v) VALUES ('outer', 1)", [])
            .unwrap();

        let res: Result<(), Error> = with_savepoint(&tx, "inner", |c| {
            c.execute("INSERT INTO t (k, v) VALUES ('inner', 2)", [])?;
            // duplicate key
            c.execute("INSERT INTO t (k, v) VALUES ('inner', 3)", [])?;
            Ok(())
        });
        assert!(res.is_err());
        assert!(!res.unwrap_err().is_transient());

        let ok: Result<(), Error> = with_savepoint(&tx, "inner", |c| {
            c.execute("INSERT INTO t (k, v) VALUES ('second', 4)", [])?;
            Ok(())
        });
        ok.unwrap();
        tx.commit().unwrap();

        let keys: Vec<String> = query_rows(&conn, "SELECT k FROM t ORDER BY k", []).unwrap();
        assert_eq!(keys, vec!["outer".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_u64_to_sql() {
        assert_eq!(u64_to_sql(5).unwrap(), 5);
        assert!(u64_to_sql(u64::MAX).is_err());
        assert_eq!(opt_u64_to_sql(None).unwrap(), None);
    }
}
