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

pub mod blocks;
pub mod microblocks;
pub mod tip;
pub mod transactions;

use std::fs;
use std::path::Path;

use indexer_common::consts::UNCONFIRMED_INDEX_BLOCK_HASH;
use rusqlite::{params, OpenFlags, OptionalExtension};

use crate::core::mempool::MemPoolDB;
use crate::util_lib::db::{
    db_exists, sqlite_open, table_exists, tx_begin_immediate, DBConn, DBTx, Error as db_error,
    MEMORY_DB_PATH,
};

pub use self::blocks::StacksBlockHeaderInfo;
pub use self::microblocks::StreamedMicroblockInfo;
pub use self::tip::ChainTip;
pub use self::transactions::{StacksTransactionInfo, TxPlacement};

pub const CHAINSTATE_VERSION: i64 = 3;

const CHAINSTATE_INITIAL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE blocks(
        index_block_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        parent_index_block_hash TEXT NOT NULL,
        parent_block_hash TEXT NOT NULL,
        parent_microblock_hash TEXT NOT NULL,
        parent_microblock_sequence INTEGER NOT NULL,
        burn_block_height INTEGER NOT NULL,
        burn_block_time INTEGER NOT NULL,
        burn_block_hash TEXT NOT NULL,
        execution_cost_read_count INTEGER NOT NULL,
        execution_cost_read_length INTEGER NOT NULL,
        execution_cost_runtime INTEGER NOT NULL,
        execution_cost_write_count INTEGER NOT NULL,
        execution_cost_write_length INTEGER NOT NULL,
        tx_count INTEGER NOT NULL,
        canonical INTEGER NOT NULL,
        PRIMARY KEY(index_block_hash)
    );
    "#,
    r#"
    -- One row per (microblock, accepting anchor block).  Rows not yet accepted by any
    -- anchor block carry the all-zero index_block_hash.
    CREATE TABLE microblocks(
        microblock_hash TEXT NOT NULL,
        microblock_sequence INTEGER NOT NULL,
        microblock_parent_hash TEXT NOT NULL,
        -- anchor block the stream is built on
        parent_index_block_hash TEXT NOT NULL,
        index_block_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        receive_time INTEGER NOT NULL,
        canonical INTEGER NOT NULL,
        microblock_canonical INTEGER NOT NULL,
        PRIMARY KEY(parent_index_block_hash, microblock_hash, index_block_hash)
    );
    "#,
    r#"
    CREATE TABLE txs(
        tx_id TEXT NOT NULL,
        tx_index INTEGER NOT NULL,
        index_block_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        parent_index_block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        burn_block_time INTEGER NOT NULL,
        -- all-zero for transactions mined in the anchored block itself
        microblock_hash TEXT NOT NULL,
        microblock_sequence INTEGER NOT NULL,
        tx_type TEXT NOT NULL,
        raw_tx TEXT NOT NULL,
        sender_address TEXT NOT NULL,
        nonce INTEGER NOT NULL,
        sponsor_address TEXT,
        sponsor_nonce INTEGER,
        fee_rate INTEGER NOT NULL,
        status TEXT NOT NULL,
        token_transfer_recipient TEXT,
        contract_id TEXT,
        canonical INTEGER NOT NULL,
        microblock_canonical INTEGER NOT NULL,
        PRIMARY KEY(tx_id, index_block_hash, microblock_hash)
    );
    "#,
    r#"
    CREATE TABLE events(
        tx_id TEXT NOT NULL,
        event_index INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        index_block_hash TEXT NOT NULL,
        parent_index_block_hash TEXT NOT NULL,
        block_height INTEGER NOT NULL,
        microblock_hash TEXT NOT NULL,
        microblock_sequence INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        asset_identifier TEXT,
        sender TEXT,
        recipient TEXT,
        amount TEXT,
        value TEXT,
        contract_identifier TEXT,
        topic TEXT,
        canonical INTEGER NOT NULL,
        microblock_canonical INTEGER NOT NULL,
        PRIMARY KEY(tx_id, index_block_hash, microblock_hash, event_index)
    );
    "#,
    r#"
    CREATE TABLE miner_rewards(
        index_block_hash TEXT NOT NULL,
        from_index_block_hash TEXT NOT NULL,
        mature_block_height INTEGER NOT NULL,
        recipient TEXT NOT NULL,
        coinbase_amount INTEGER NOT NULL,
        tx_fees_anchored INTEGER NOT NULL,
        tx_fees_streamed_confirmed INTEGER NOT NULL,
        tx_fees_streamed_produced INTEGER NOT NULL,
        canonical INTEGER NOT NULL,
        PRIMARY KEY(index_block_hash, from_index_block_hash, recipient)
    );
    "#,
    r#"
    CREATE TABLE chain_tip(
        id INTEGER PRIMARY KEY CHECK (id = 1),
        block_height INTEGER NOT NULL,
        index_block_hash TEXT NOT NULL,
        block_hash TEXT NOT NULL,
        burn_block_height INTEGER NOT NULL,
        microblock_hash TEXT,
        microblock_sequence INTEGER,
        mempool_tx_count INTEGER NOT NULL,
        mempool_digest TEXT NOT NULL,
        version INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE schema_version(version INTEGER NOT NULL);
    "#,
];

/// Tracks the arrival order of blocks, so that the first of several equal-height
/// siblings can be told apart from later ones.
const CHAINSTATE_SCHEMA_2: &[&str] = &[
    r#"
    ALTER TABLE blocks ADD COLUMN receive_order INTEGER NOT NULL DEFAULT 0;
    "#,
    r#"
    UPDATE blocks SET receive_order = rowid;
    "#,
    r#"
    UPDATE schema_version SET version = 2;
    "#,
];

/// Counts changes to the pending mempool set, so the chain tip can re-derive its mempool
/// digest without reading the mempool.
const CHAINSTATE_SCHEMA_3: &[&str] = &[
    r#"
    ALTER TABLE chain_tip ADD COLUMN mempool_changes INTEGER NOT NULL DEFAULT 0;
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS mempool_pending_added
    AFTER INSERT ON mempool_txs
    WHEN NEW.pruned = 0
    BEGIN
        UPDATE chain_tip SET mempool_changes = mempool_changes + 1 WHERE id = 1;
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS mempool_pending_toggled
    AFTER UPDATE OF pruned ON mempool_txs
    WHEN OLD.pruned != NEW.pruned
    BEGIN
        UPDATE chain_tip SET mempool_changes = mempool_changes + 1 WHERE id = 1;
    END
    "#,
    r#"
    CREATE TRIGGER IF NOT EXISTS mempool_pending_deleted
    AFTER DELETE ON mempool_txs
    WHEN OLD.pruned = 0
    BEGIN
        UPDATE chain_tip SET mempool_changes = mempool_changes + 1 WHERE id = 1;
    END
    "#,
    r#"
    UPDATE schema_version SET version = 3;
    "#,
];

const CHAINSTATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS blocks_by_height ON blocks(block_height, canonical);",
    "CREATE INDEX IF NOT EXISTS blocks_by_parent ON blocks(parent_index_block_hash);",
    "CREATE INDEX IF NOT EXISTS microblocks_by_stream ON microblocks(parent_index_block_hash, microblock_sequence);",
    "CREATE INDEX IF NOT EXISTS microblocks_by_block ON microblocks(index_block_hash);",
    "CREATE INDEX IF NOT EXISTS txs_by_block ON txs(index_block_hash);",
    "CREATE INDEX IF NOT EXISTS txs_by_stream ON txs(parent_index_block_hash, microblock_hash);",
    "CREATE INDEX IF NOT EXISTS txs_by_visibility ON txs(tx_id, canonical, microblock_canonical);",
    "CREATE INDEX IF NOT EXISTS txs_by_sender ON txs(sender_address, nonce);",
    "CREATE INDEX IF NOT EXISTS txs_by_sponsor ON txs(sponsor_address, sponsor_nonce);",
    "CREATE INDEX IF NOT EXISTS txs_by_recipient ON txs(token_transfer_recipient);",
    "CREATE INDEX IF NOT EXISTS events_by_block ON events(index_block_hash);",
    "CREATE INDEX IF NOT EXISTS events_by_stream ON events(parent_index_block_hash, microblock_hash);",
    "CREATE INDEX IF NOT EXISTS events_by_sender ON events(sender);",
    "CREATE INDEX IF NOT EXISTS events_by_recipient ON events(recipient);",
    "CREATE INDEX IF NOT EXISTS miner_rewards_by_block ON miner_rewards(index_block_hash);",
];

/// Handle on the indexer's store: chain history, mempool, and chain tip all live in
/// one sqlite database so that a reconciliation commits atomically.
pub struct ChainStateDB {
    pub db: DBConn,
    path: String,
    pub mainnet: bool,
}

impl ChainStateDB {
    #[cfg_attr(test, mutants::skip)]
    fn instantiate_chainstate_db(conn: &mut DBConn) -> Result<(), db_error> {
        let mut tx = tx_begin_immediate(conn)?;

        for cmd in CHAINSTATE_INITIAL_SCHEMA {
            tx.execute_batch(cmd)?;
        }
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![1],
        )?;
        tx.execute(
            "INSERT INTO chain_tip (id, block_height, index_block_hash, block_hash, burn_block_height, mempool_tx_count, mempool_digest, version)
             VALUES (1, 0, ?1, ?2, 0, 0, '', 0)",
            params![UNCONFIRMED_INDEX_BLOCK_HASH, indexer_common::consts::FIRST_STACKS_BLOCK_HASH],
        )?;

        MemPoolDB::instantiate_mempool_schema(&tx)?;

        ChainStateDB::apply_schema_migrations(&mut tx)?;
        ChainStateDB::add_indexes(&mut tx)?;

        tx.commit()?;
        Ok(())
    }

    /// Load the schema version from the database, if it's new enough to have such a version.
    fn get_schema_version(conn: &DBConn) -> Result<Option<i64>, db_error> {
        if !table_exists(conn, "schema_version")? {
            return Ok(None);
        }
        let version = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(version)
    }

    /// Apply all schema migrations up to the latest schema.
    fn apply_schema_migrations(tx: &mut DBTx) -> Result<(), db_error> {
        loop {
            let version = ChainStateDB::get_schema_version(tx)?.unwrap_or(1);
            match version {
                1 => {
                    for cmd in CHAINSTATE_SCHEMA_2 {
                        tx.execute_batch(cmd)?;
                    }
                }
                2 => {
                    for cmd in CHAINSTATE_SCHEMA_3 {
                        tx.execute_batch(cmd)?;
                    }
                }
                CHAINSTATE_VERSION => {
                    break;
                }
                _ => {
                    error!("Unknown chainstate schema version"; "version" => version);
                    return Err(db_error::Corruption);
                }
            }
        }
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)]
    fn add_indexes(tx: &mut DBTx) -> Result<(), db_error> {
        for cmd in CHAINSTATE_INDEXES {
            tx.execute_batch(cmd)?;
        }
        MemPoolDB::add_indexes(tx)?;
        Ok(())
    }

    /// Open (and if need be, create) the store at `path`.  `:memory:` opens a private
    /// in-memory store, which is what the tests use.
    pub fn open(mainnet: bool, path: &str) -> Result<ChainStateDB, db_error> {
        let create_flag = !db_exists(path);
        if create_flag && path != MEMORY_DB_PATH {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(db_error::IOError)?;
                }
            }
        }
        let open_flags = if create_flag {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        let mut conn = sqlite_open(path, open_flags, false)?;
        if create_flag {
            ChainStateDB::instantiate_chainstate_db(&mut conn)?;
        } else {
            let mut tx = tx_begin_immediate(&mut conn)?;
            ChainStateDB::apply_schema_migrations(&mut tx)?;
            ChainStateDB::add_indexes(&mut tx)?;
            tx.commit()?;
        }

        debug!("Opened chainstate"; "path" => path, "mainnet" => mainnet);
        Ok(ChainStateDB {
            db: conn,
            path: path.to_string(),
            mainnet,
        })
    }

    #[cfg(test)]
    pub fn open_test() -> ChainStateDB {
        ChainStateDB::open(false, MEMORY_DB_PATH).expect("failed to open in-memory chainstate")
    }

    /// Open another connection to the same store, e.g. for a reader thread.
    /// Readers see the last committed state and never a reconciliation in progress.
    pub fn reopen(&self, readwrite: bool) -> Result<DBConn, db_error> {
        if self.path == MEMORY_DB_PATH {
            // a second connection to :memory: would be a different database
            return Err(db_error::NoDBError);
        }
        if let Err(e) = fs::metadata(&self.path) {
            return Err(db_error::IOError(e));
        }

        let open_flags = if readwrite {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        };

        let conn = sqlite_open(&self.path, open_flags, false)?;
        Ok(conn)
    }

    pub fn conn(&self) -> &DBConn {
        &self.db
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tx_begin(&mut self) -> Result<DBTx<'_>, db_error> {
        tx_begin_immediate(&mut self.db)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util_lib::db::query_count;

    #[test]
    fn test_instantiate_and_reopen() {
        let path = format!(
            "/tmp/stacks-indexer-test-instantiate-{}-{}.sqlite",
            std::process::id(),
            indexer_common::util::get_epoch_time_secs()
        );
        {
            let chainstate = ChainStateDB::open(false, &path).unwrap();
            assert_eq!(
                ChainStateDB::get_schema_version(chainstate.conn()).unwrap(),
                Some(CHAINSTATE_VERSION)
            );
            let tip = ChainStateDB::get_chain_tip(chainstate.conn()).unwrap();
            assert_eq!(tip.block_height, 0);
            assert_eq!(tip.version, 0);
        }

        // reopening an existing store must not re-run instantiation
        let chainstate = ChainStateDB::open(false, &path).unwrap();
        assert_eq!(
            query_count(chainstate.conn(), "SELECT COUNT(*) FROM chain_tip", []).unwrap(),
            1
        );
        let reader = chainstate.reopen(false).unwrap();
        assert!(table_exists(&reader, "mempool_txs").unwrap());
        drop(reader);
        drop(chainstate);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(format!("{path}-wal"));
        let _ = fs::remove_file(format!("{path}-shm"));
    }

    #[test]
    fn test_memory_db_cannot_reopen() {
        let chainstate = ChainStateDB::open_test();
        assert!(matches!(chainstate.reopen(false), Err(db_error::NoDBError)));
    }
}
