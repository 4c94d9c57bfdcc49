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

use std::backtrace::Backtrace;
use std::sync::{LazyLock, Mutex};
use std::thread;
use std::time::Instant;

use hashbrown::HashMap;
use rusqlite::Connection;

use crate::util::{backoff_ms, sleep_ms};

/// Sleep cap per busy retry
const BUSY_SLEEP_CAP_MS: u64 = 100;
/// Busy retries between deadlock reports, roughly five minutes at the cap
const DEADLOCK_REPORT_INTERVAL: u32 = 3_000;

/// Last writer of each database, keyed by the connection's path, for deadlock reports.
static WRITERS: LazyLock<Mutex<HashMap<String, String>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));
static PROCESS_START: LazyLock<Instant> = LazyLock::new(Instant::now);

fn connection_key(conn: &Connection) -> String {
    conn.path()
        .map(|path| path.to_string())
        .unwrap_or_else(|| format!("{conn:?}"))
}

/// Record the calling thread as the holder of `conn`'s write lock.
pub fn update_lock_table(conn: &Connection) {
    let holder = format!(
        "{:?}@{}ms",
        thread::current().name(),
        PROCESS_START.elapsed().as_millis()
    );
    if let Ok(mut writers) = WRITERS.lock() {
        writers.insert(connection_key(conn), holder);
    }
}

fn report_probable_deadlock(run_count: u32) {
    error!("Probable deadlock: still waiting for a database lock";
        "run_count" => run_count,
        "backtrace" => ?Backtrace::capture()
    );
    if let Ok(writers) = WRITERS.lock() {
        for (db, holder) in writers.iter() {
            error!("Last writer"; "db" => db, "holder" => holder);
        }
    }
}

/// `rusqlite` busy handler: back off and always retry.
pub fn tx_busy_handler(run_count: i32) -> bool {
    let run_count = run_count.unsigned_abs();
    if run_count > 0 && run_count % DEADLOCK_REPORT_INTERVAL == 0 {
        report_probable_deadlock(run_count);
    }

    let sleep_time_ms = backoff_ms(run_count, BUSY_SLEEP_CAP_MS);
    if run_count > 10 && run_count % 10 == 0 {
        warn!("Database is locked; retrying"; "run_count" => run_count, "sleep_ms" => sleep_time_ms);
    } else {
        debug!("Database is locked; retrying"; "sleep_ms" => sleep_time_ms);
    }
    sleep_ms(sleep_time_ms);
    true
}
