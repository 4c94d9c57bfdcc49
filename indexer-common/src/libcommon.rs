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

#![allow(unused_macros)]
#![allow(non_camel_case_types)]
#![cfg_attr(test, allow(unused_variables, unused_assignments))]

#[allow(unused_imports)]
#[macro_use(o, slog_log, slog_trace, slog_debug, slog_info, slog_warn, slog_error)]
extern crate slog;

#[macro_use]
extern crate serde_derive;

#[macro_use]
pub mod util;

pub mod types;

pub mod consts {
    use crate::types::chainstate::{BlockHeaderHash, StacksBlockId};

    /// Parent of the genesis block, and the "no microblock" marker.
    pub const FIRST_STACKS_BLOCK_HASH: BlockHeaderHash = BlockHeaderHash([0u8; 32]);

    /// Index hash carried by streamed rows which no anchor block has accepted yet.
    pub const UNCONFIRMED_INDEX_BLOCK_HASH: StacksBlockId = StacksBlockId([0u8; 32]);

    /// Sequence number carried by anchored transactions.
    pub const MICROBLOCK_SEQUENCE_NONE: u32 = 2147483647;

    pub const CHAIN_ID_MAINNET: u32 = 0x00000001;
    pub const CHAIN_ID_TESTNET: u32 = 0x80000000;
}
