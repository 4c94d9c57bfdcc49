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

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]
#![cfg_attr(test, allow(unused_variables, unused_assignments))]
#![allow(clippy::result_large_err)]

//! Chain-state reconciliation for the Stacks blockchain API: fork choice over
//! anchored blocks and microblock streams, the mempool lifecycle, and the
//! versioned chain tip whose changes are published to observers.

#[allow(unused_imports)]
#[macro_use(o, slog_log, slog_trace, slog_debug, slog_info, slog_warn, slog_error)]
extern crate slog;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate indexer_common;

#[cfg(feature = "monitoring_prom")]
extern crate prometheus;

extern crate rusqlite;
extern crate serde_json;

#[macro_use]
pub mod util_lib;

pub mod chainstate;
pub mod cli;
pub mod config;
pub mod core;
pub mod event_dispatcher;
pub mod feed;
pub mod monitoring;
