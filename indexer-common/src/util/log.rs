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

use std::env;
use std::sync::{LazyLock, Mutex};

use slog::{Drain, Level, Logger};

pub static LOGGER: LazyLock<Logger> = LazyLock::new(make_logger);

#[cfg(feature = "slog_json")]
fn make_json_logger() -> Logger {
    let drain = Mutex::new(slog_json::Json::default(std::io::stderr())).fuse();
    let filtered_drain = slog::LevelFilter::new(drain, get_loglevel()).ignore_res();
    Logger::root(filtered_drain, o!())
}

/// Built without `slog_json`: fall back to the terminal format.
#[cfg(not(feature = "slog_json"))]
fn make_json_logger() -> Logger {
    make_term_logger()
}

fn make_term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator)
        .use_original_order()
        .build();
    let drain = Mutex::new(drain).fuse();
    let filtered_drain = slog::LevelFilter::new(drain, get_loglevel()).ignore_res();
    Logger::root(filtered_drain, o!())
}

fn make_logger() -> Logger {
    if env::var("STACKS_LOG_JSON") == Ok("1".into()) {
        make_json_logger()
    } else {
        make_term_logger()
    }
}

pub fn get_loglevel() -> Level {
    if env::var("STACKS_LOG_TRACE") == Ok("1".into()) {
        Level::Trace
    } else if env::var("STACKS_LOG_DEBUG") == Ok("1".into()) {
        Level::Debug
    } else {
        Level::Info
    }
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => ({
        slog_trace!($crate::util::log::LOGGER, $($arg)*)
    })
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => ({
        slog_error!($crate::util::log::LOGGER, $($arg)*)
    })
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ({
        slog_warn!($crate::util::log::LOGGER, $($arg)*)
    })
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ({
        slog_info!($crate::util::log::LOGGER, $($arg)*)
    })
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ({
        slog_debug!($crate::util::log::LOGGER, $($arg)*)
    })
}
