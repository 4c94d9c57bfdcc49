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

#[macro_use]
pub mod log;
#[macro_use]
pub mod macros;
#[cfg(feature = "rusqlite")]
pub mod db;
pub mod hash;

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};

fn since_epoch() -> Duration {
    // a clock set before 1970 reads as the epoch itself
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub fn get_epoch_time_secs() -> u64 {
    since_epoch().as_secs()
}

pub fn sleep_ms(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

/// Delay before retry number `attempt`: `2^attempt` ms plus up to as much again in jitter.
/// Once that exceeds `cap_ms`, a jittered value around `cap_ms` is used instead.
pub fn backoff_ms(attempt: u32, cap_ms: u64) -> u64 {
    let base = 2u64.saturating_pow(attempt);
    let delay = base.saturating_add(thread_rng().gen_range(0..base));
    if delay <= cap_ms {
        return delay;
    }
    let jitter = (cap_ms / 10).max(1);
    thread_rng().gen_range(cap_ms.saturating_sub(jitter)..cap_ms.saturating_add(jitter))
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum HexError {
    #[error("bad length {0} for hex string")]
    BadLength(usize),
    #[error("bad character {0} for hex string")]
    BadCharacter(char),
}
