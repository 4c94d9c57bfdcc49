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

pub mod coordinator;
pub mod db;
pub mod reorg;

use std::{error, fmt};

use indexer_common::types::chainstate::{
    BlockHeaderHash, BurnchainHeaderHash, StacksBlockId, Txid,
};
use indexer_common::types::StacksAddress;

use crate::util_lib::db::Error as db_error;

define_named_sql_enum!(TransactionType {
    TokenTransfer("token_transfer"),
    SmartContract("smart_contract"),
    ContractCall("contract_call"),
    PoisonMicroblock("poison_microblock"),
    Coinbase("coinbase"),
    TenureChange("tenure_change"),
});

define_named_sql_enum!(TransactionStatus {
    Pending("pending"),
    Success("success"),
    AbortByResponse("abort_by_response"),
    AbortByPostCondition("abort_by_post_condition"),
    DroppedReplaceByFee("dropped_replace_by_fee"),
    DroppedReplaceAcrossFork("dropped_replace_across_fork"),
    DroppedTooExpensive("dropped_too_expensive"),
    DroppedStaleGarbageCollect("dropped_stale_garbage_collect"),
    DroppedProblematic("dropped_problematic"),
    DroppedApiGarbageCollect("dropped_api_garbage_collect"),
});

define_named_sql_enum!(AssetEventType {
    StxTransfer("stx_transfer"),
    StxMint("stx_mint"),
    StxBurn("stx_burn"),
    StxLock("stx_lock"),
    FtTransfer("ft_transfer"),
    FtMint("ft_mint"),
    FtBurn("ft_burn"),
    NftTransfer("nft_transfer"),
    NftMint("nft_mint"),
    NftBurn("nft_burn"),
    ContractLog("contract_log"),
});

impl TransactionStatus {
    /// Statuses a mined transaction can carry.
    pub fn is_executed(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success
                | TransactionStatus::AbortByResponse
                | TransactionStatus::AbortByPostCondition
        )
    }

    pub fn is_dropped(&self) -> bool {
        !self.is_executed() && *self != TransactionStatus::Pending
    }
}

/// Execution cost of a block, as reported by the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCost {
    pub write_length: u64,
    pub write_count: u64,
    pub read_length: u64,
    pub read_count: u64,
    pub runtime: u64,
}

/// An anchored block, as delivered by the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockData {
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub block_height: u64,
    pub parent_index_block_hash: StacksBlockId,
    pub parent_block_hash: BlockHeaderHash,
    /// Tail of the parent's microblock stream that this block confirms.
    /// All zeros if it confirms none.
    #[serde(default = "BlockHeaderHash::sentinel")]
    pub parent_microblock_hash: BlockHeaderHash,
    #[serde(default)]
    pub parent_microblock_sequence: u32,
    pub burn_block_height: u64,
    pub burn_block_time: u64,
    pub burn_block_hash: BurnchainHeaderHash,
    #[serde(default)]
    pub execution_cost: ExecutionCost,
}

impl BlockData {
    pub fn is_genesis(&self) -> bool {
        self.block_height == 1 && self.parent_index_block_hash.is_zero()
    }

    pub fn confirms_microblocks(&self) -> bool {
        !self.parent_microblock_hash.is_zero()
    }
}

/// A microblock header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroblockData {
    pub microblock_hash: BlockHeaderHash,
    pub microblock_sequence: u32,
    /// Previous microblock in the stream; for sequence 0 this is the anchor's block hash.
    pub microblock_parent_hash: BlockHeaderHash,
    /// The anchor block this stream builds on.
    pub parent_index_block_hash: StacksBlockId,
    #[serde(default)]
    pub receive_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    pub tx_id: Txid,
    pub tx_index: u32,
    pub tx_type: TransactionType,
    /// Hex-encoded consensus serialization
    pub raw_tx: String,
    pub sender_address: StacksAddress,
    pub nonce: u64,
    #[serde(default)]
    pub sponsor_address: Option<StacksAddress>,
    #[serde(default)]
    pub sponsor_nonce: Option<u64>,
    pub fee_rate: u64,
    pub status: TransactionStatus,
    #[serde(default)]
    pub token_transfer_recipient: Option<String>,
    #[serde(default)]
    pub contract_id: Option<String>,
    /// Set if this transaction was streamed in a microblock rather than mined in the anchor.
    #[serde(default)]
    pub microblock_hash: Option<BlockHeaderHash>,
}

impl TransactionData {
    /// The account whose nonce pays for this transaction.
    pub fn payer(&self) -> (&StacksAddress, u64) {
        match (&self.sponsor_address, self.sponsor_nonce) {
            (Some(addr), Some(nonce)) => (addr, nonce),
            _ => (&self.sender_address, self.nonce),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub tx_id: Txid,
    pub event_index: u32,
    pub event_type: AssetEventType,
    #[serde(default)]
    pub asset_identifier: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    /// Decimal string; amounts may exceed 64 bits
    #[serde(default)]
    pub amount: Option<String>,
    /// Hex-encoded Clarity value for NFT and log events
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub contract_identifier: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerRewardData {
    pub from_index_block_hash: StacksBlockId,
    pub mature_block_height: u64,
    pub recipient: String,
    pub coinbase_amount: u64,
    #[serde(default)]
    pub tx_fees_anchored: u64,
    #[serde(default)]
    pub tx_fees_streamed_confirmed: u64,
    #[serde(default)]
    pub tx_fees_streamed_produced: u64,
}

/// Everything the node reports for one anchored block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockIngest {
    pub block: BlockData,
    #[serde(default)]
    pub txs: Vec<TransactionData>,
    /// Headers of the parent-stream microblocks this block confirms, for any not
    /// already received through a microblock stream.
    #[serde(default)]
    pub microblocks: Vec<MicroblockData>,
    #[serde(default)]
    pub miner_rewards: Vec<MinerRewardData>,
    #[serde(default)]
    pub events: Vec<EventData>,
}

/// A batch of unconfirmed microblocks built on one anchor block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroblockStream {
    pub parent_index_block_hash: StacksBlockId,
    pub microblocks: Vec<MicroblockData>,
    #[serde(default)]
    pub txs: Vec<TransactionData>,
    #[serde(default)]
    pub events: Vec<EventData>,
}

#[derive(Debug)]
pub enum Error {
    /// The parent block has not been ingested
    UnknownParentBlock(StacksBlockId),
    /// A microblock's parent is missing from its stream (anchor, microblock hash)
    UnknownParentMicroblock(StacksBlockId, BlockHeaderHash),
    /// A different block was already stored under this index block hash
    DuplicateBlock(StacksBlockId),
    /// Block height is not its parent's height plus one
    InvalidBlockHeight(StacksBlockId, u64, u64),
    /// A reorg would walk back further than allowed (depth, max)
    ReorgDepthExceeded(u64, u64),
    /// The store is temporarily unusable; retry later
    StoreUnavailable(db_error),
    /// Any other store failure
    DBError(db_error),
    /// Malformed ingestion data
    InvalidData(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnknownParentBlock(id) => write!(f, "Unknown parent block {id}"),
            Error::UnknownParentMicroblock(anchor, mblock) => {
                write!(f, "Unknown parent microblock {mblock} in stream of {anchor}")
            }
            Error::DuplicateBlock(id) => {
                write!(f, "Block {id} already stored with different contents")
            }
            Error::InvalidBlockHeight(id, expected, actual) => write!(
                f,
                "Block {id} has height {actual}, expected {expected}"
            ),
            Error::ReorgDepthExceeded(depth, max) => {
                write!(f, "Reorg depth {depth} exceeds maximum of {max}")
            }
            Error::StoreUnavailable(e) => write!(f, "Store unavailable: {e}"),
            Error::DBError(e) => fmt::Display::fmt(e, f),
            Error::InvalidData(s) => write!(f, "Invalid data: {s}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::StoreUnavailable(e) | Error::DBError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<db_error> for Error {
    fn from(e: db_error) -> Error {
        if e.is_transient() {
            Error::StoreUnavailable(e)
        } else {
            Error::DBError(e)
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Error {
        Error::from(db_error::SqliteError(e))
    }
}

impl Error {
    /// Should the driver back off and retry the same input?
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}
