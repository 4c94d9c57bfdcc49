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

use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId};
use indexer_common::util::hash::Sha512Trunc256Sum;
use rusqlite::{Row, ToSql};
use sha2::{Digest, Sha512_256};

use crate::chainstate::db::ChainStateDB;
use crate::core::mempool::MemPoolDB;
use crate::util_lib::db::{
    query_row, u64_to_sql, DBConn, DBTx, Error as db_error, FromColumn, FromRow,
};

/// The canonical chain tip, as of the last committed reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTip {
    pub block_height: u64,
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub burn_block_height: u64,
    /// Latest microblock-canonical microblock streamed on top of the tip, if any
    pub microblock_hash: Option<BlockHeaderHash>,
    pub microblock_sequence: Option<u32>,
    pub mempool_tx_count: u64,
    pub mempool_digest: String,
    /// Bumped on every committed write
    pub version: u64,
}

impl ChainTip {
    /// No block has been ingested yet
    pub fn is_empty(&self) -> bool {
        self.index_block_hash.is_zero()
    }

    /// Validator for responses that depend only on the chain tip.
    pub fn block_etag(&self) -> String {
        match &self.microblock_hash {
            Some(mblock) => format!("{}:{}", self.index_block_hash, mblock),
            None => format!("{}", self.index_block_hash),
        }
    }

    /// Changes whenever the pending set changes: `changes` is bumped by triggers on the
    /// mempool table.
    fn mempool_digest(changes: u64) -> String {
        let mut hasher = Sha512_256::new();
        hasher.update(changes.to_be_bytes());
        Sha512Trunc256Sum::from_hasher(hasher).to_hex()
    }

    /// Validator for responses that depend on mempool contents.
    pub fn mempool_etag(&self) -> String {
        format!("{}:{}", self.mempool_tx_count, self.mempool_digest)
    }
}

impl FromRow<ChainTip> for ChainTip {
    fn from_row(row: &Row) -> Result<ChainTip, db_error> {
        Ok(ChainTip {
            block_height: u64::from_column(row, "block_height")?,
            index_block_hash: StacksBlockId::from_column(row, "index_block_hash")?,
            block_hash: BlockHeaderHash::from_column(row, "block_hash")?,
            burn_block_height: u64::from_column(row, "burn_block_height")?,
            microblock_hash: BlockHeaderHash::from_column(row, "microblock_hash")?,
            microblock_sequence: row.get("microblock_sequence")?,
            mempool_tx_count: u64::from_column(row, "mempool_tx_count")?,
            mempool_digest: row.get("mempool_digest")?,
            version: u64::from_column(row, "version")?,
        })
    }
}

impl ChainStateDB {
    pub fn get_chain_tip(conn: &DBConn) -> Result<ChainTip, db_error> {
        query_row(conn, "SELECT * FROM chain_tip WHERE id = 1", [])?.ok_or(db_error::Corruption)
    }

    fn get_mempool_changes(conn: &DBConn) -> Result<u64, db_error> {
        query_row(conn, "SELECT mempool_changes FROM chain_tip WHERE id = 1", [])?
            .ok_or(db_error::Corruption)
    }

    /// Recompute the chain tip from the canonical chain and the mempool, and bump its version.
    /// Must run inside the same transaction as the write it reflects.
    pub fn update_chain_tip(tx: &DBTx) -> Result<ChainTip, db_error> {
        let prior = ChainStateDB::get_chain_tip(tx)?;
        let tip_block = ChainStateDB::get_canonical_tip_block(tx)?;
        let (microblock_hash, microblock_sequence) = match &tip_block {
            Some(block) => {
                match ChainStateDB::get_latest_unconfirmed_microblock(tx, block.index_block_hash())? {
                    Some(mblock) if mblock.canonical => (
                        Some(mblock.microblock.microblock_hash),
                        Some(mblock.microblock.microblock_sequence),
                    ),
                    _ => (None, None),
                }
            }
            None => (None, None),
        };

        let tip = ChainTip {
            block_height: tip_block.as_ref().map_or(0, |b| b.block_height()),
            index_block_hash: tip_block
                .as_ref()
                .map_or(StacksBlockId::sentinel(), |b| b.block.index_block_hash),
            block_hash: tip_block
                .as_ref()
                .map_or(BlockHeaderHash::sentinel(), |b| b.block.block_hash),
            burn_block_height: tip_block.as_ref().map_or(0, |b| b.block.burn_block_height),
            microblock_hash,
            microblock_sequence,
            mempool_tx_count: MemPoolDB::get_pending_count(tx)?,
            mempool_digest: ChainTip::mempool_digest(ChainStateDB::get_mempool_changes(tx)?),
            version: prior.version.checked_add(1).ok_or(db_error::Overflow)?,
        };

        let args: &[&dyn ToSql] = &[
            &u64_to_sql(tip.block_height)?,
            &tip.index_block_hash,
            &tip.block_hash,
            &u64_to_sql(tip.burn_block_height)?,
            &tip.microblock_hash,
            &tip.microblock_sequence,
            &u64_to_sql(tip.mempool_tx_count)?,
            &tip.mempool_digest,
            &u64_to_sql(tip.version)?,
        ];
        tx.execute(
            "UPDATE chain_tip SET block_height = ?1, index_block_hash = ?2, block_hash = ?3,
                burn_block_height = ?4, microblock_hash = ?5, microblock_sequence = ?6,
                mempool_tx_count = ?7, mempool_digest = ?8, version = ?9
             WHERE id = 1",
            args,
        )?;
        Ok(tip)
    }

    /// Validator for responses scoped to one address: changes whenever a canonical
    /// transaction or event touching the address is added or rolled back.
    pub fn get_address_etag(conn: &DBConn, address: &str) -> Result<String, db_error> {
        let (latest_tx, latest_event) = ChainStateDB::get_latest_address_activity(conn, address)?;
        let mut hasher = Sha512_256::new();
        hasher.update(address.as_bytes());
        if let Some((txid, index_block_hash, microblock_hash)) = latest_tx {
            hasher.update(txid.0);
            hasher.update(index_block_hash.0);
            hasher.update(microblock_hash.0);
        }
        if let Some((txid, index_block_hash, event_index)) = latest_event {
            hasher.update(txid.0);
            hasher.update(index_block_hash.0);
            hasher.update(event_index.to_be_bytes());
        }
        Ok(Sha512Trunc256Sum::from_hasher(hasher).to_hex())
    }
}
