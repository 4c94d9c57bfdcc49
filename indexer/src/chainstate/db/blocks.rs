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

use indexer_common::consts::UNCONFIRMED_INDEX_BLOCK_HASH;
use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId, Txid};
use rusqlite::{params, Row, ToSql};

use crate::chainstate::db::transactions::TxPlacement;
use crate::chainstate::db::ChainStateDB;
use crate::chainstate::{BlockData, BlockIngest, ExecutionCost, MinerRewardData, TransactionData};
use crate::event_dispatcher::BlockIdentifier;
use crate::util_lib::db::{
    query_row, query_rows, u64_to_sql, DBConn, DBTx, Error as db_error, FromColumn, FromRow,
};

/// A block as stored, with its current canonical status.
#[derive(Debug, Clone, PartialEq)]
pub struct StacksBlockHeaderInfo {
    pub block: BlockData,
    pub tx_count: u64,
    pub canonical: bool,
    pub receive_order: u64,
}

impl StacksBlockHeaderInfo {
    pub fn index_block_hash(&self) -> &StacksBlockId {
        &self.block.index_block_hash
    }

    pub fn block_height(&self) -> u64 {
        self.block.block_height
    }

    pub fn to_identifier(&self) -> BlockIdentifier {
        BlockIdentifier {
            index_block_hash: self.block.index_block_hash,
            block_hash: self.block.block_hash,
            block_height: self.block.block_height,
        }
    }
}

impl FromRow<StacksBlockHeaderInfo> for StacksBlockHeaderInfo {
    fn from_row(row: &Row) -> Result<StacksBlockHeaderInfo, db_error> {
        let execution_cost = ExecutionCost {
            read_count: u64::from_column(row, "execution_cost_read_count")?,
            read_length: u64::from_column(row, "execution_cost_read_length")?,
            runtime: u64::from_column(row, "execution_cost_runtime")?,
            write_count: u64::from_column(row, "execution_cost_write_count")?,
            write_length: u64::from_column(row, "execution_cost_write_length")?,
        };
        let parent_microblock_sequence: u32 = row.get("parent_microblock_sequence")?;
        let block = BlockData {
            index_block_hash: StacksBlockId::from_column(row, "index_block_hash")?,
            block_hash: BlockHeaderHash::from_column(row, "block_hash")?,
            block_height: u64::from_column(row, "block_height")?,
            parent_index_block_hash: StacksBlockId::from_column(row, "parent_index_block_hash")?,
            parent_block_hash: BlockHeaderHash::from_column(row, "parent_block_hash")?,
            parent_microblock_hash: BlockHeaderHash::from_column(row, "parent_microblock_hash")?,
            parent_microblock_sequence,
            burn_block_height: u64::from_column(row, "burn_block_height")?,
            burn_block_time: u64::from_column(row, "burn_block_time")?,
            burn_block_hash: row.get("burn_block_hash")?,
            execution_cost,
        };
        let canonical: bool = row.get("canonical")?;
        Ok(StacksBlockHeaderInfo {
            block,
            tx_count: u64::from_column(row, "tx_count")?,
            canonical,
            receive_order: u64::from_column(row, "receive_order")?,
        })
    }
}

impl ChainStateDB {
    pub fn get_block(
        conn: &DBConn,
        index_block_hash: &StacksBlockId,
    ) -> Result<Option<StacksBlockHeaderInfo>, db_error> {
        let sql = "SELECT * FROM blocks WHERE index_block_hash = ?1";
        query_row(conn, sql, params![index_block_hash])
    }

    #[cfg(test)]
    pub fn has_block(conn: &DBConn, index_block_hash: &StacksBlockId) -> Result<bool, db_error> {
        Ok(ChainStateDB::get_block(conn, index_block_hash)?.is_some())
    }

    /// Highest canonical block, if any block has been ingested yet.
    pub fn get_canonical_tip_block(
        conn: &DBConn,
    ) -> Result<Option<StacksBlockHeaderInfo>, db_error> {
        let sql = "SELECT * FROM blocks WHERE canonical = 1 ORDER BY block_height DESC LIMIT 1";
        query_row(conn, sql, [])
    }

    #[cfg(test)]
    pub fn get_canonical_block_at_height(
        conn: &DBConn,
        block_height: u64,
    ) -> Result<Option<StacksBlockHeaderInfo>, db_error> {
        let sql = "SELECT * FROM blocks WHERE block_height = ?1 AND canonical = 1";
        query_row(conn, sql, params![u64_to_sql(block_height)?])
    }

    /// Canonical blocks strictly above `block_height`, tip first.
    pub fn get_canonical_blocks_above(
        conn: &DBConn,
        block_height: u64,
    ) -> Result<Vec<StacksBlockHeaderInfo>, db_error> {
        let sql = "SELECT * FROM blocks WHERE block_height > ?1 AND canonical = 1
                   ORDER BY block_height DESC";
        query_rows(conn, sql, params![u64_to_sql(block_height)?])
    }

    /// Every stored block at a height, in the order they were received.
    #[cfg(test)]
    pub fn get_blocks_at_height(
        conn: &DBConn,
        block_height: u64,
    ) -> Result<Vec<StacksBlockHeaderInfo>, db_error> {
        let sql = "SELECT * FROM blocks WHERE block_height = ?1 ORDER BY receive_order ASC";
        query_rows(conn, sql, params![u64_to_sql(block_height)?])
    }

    /// Txids mined directly in a block, by `tx_index`.
    pub fn get_anchored_txids(
        conn: &DBConn,
        index_block_hash: &StacksBlockId,
    ) -> Result<Vec<Txid>, db_error> {
        let sql = "SELECT tx_id FROM txs WHERE index_block_hash = ?1 AND microblock_hash = ?2
                   ORDER BY tx_index ASC";
        query_rows(conn, sql, params![index_block_hash, BlockHeaderHash::sentinel()])
    }

    /// Does `ingest` describe exactly the block already stored as `existing`?
    pub fn is_same_block(
        conn: &DBConn,
        existing: &StacksBlockHeaderInfo,
        ingest: &BlockIngest,
    ) -> Result<bool, db_error> {
        if existing.block != ingest.block || existing.tx_count != ingest.txs.len() as u64 {
            return Ok(false);
        }
        let mut anchored: Vec<&TransactionData> = ingest
            .txs
            .iter()
            .filter(|t| t.microblock_hash.is_none())
            .collect();
        anchored.sort_by_key(|t| t.tx_index);
        let stored = ChainStateDB::get_anchored_txids(conn, &existing.block.index_block_hash)?;
        Ok(stored.len() == anchored.len()
            && stored.iter().zip(anchored.iter()).all(|(a, b)| *a == b.tx_id))
    }

    /// Store a block and everything that hangs off of it, initially non-canonical.
    /// Transactions streamed in the parent's microblocks are stored by the caller once the
    /// confirmed stream is known.
    pub fn insert_block(tx: &DBTx, ingest: &BlockIngest) -> Result<(), db_error> {
        let block = &ingest.block;
        let cost = &block.execution_cost;
        let args: &[&dyn ToSql] = &[
            &block.index_block_hash,
            &block.block_hash,
            &u64_to_sql(block.block_height)?,
            &block.parent_index_block_hash,
            &block.parent_block_hash,
            &block.parent_microblock_hash,
            &block.parent_microblock_sequence,
            &u64_to_sql(block.burn_block_height)?,
            &u64_to_sql(block.burn_block_time)?,
            &block.burn_block_hash,
            &u64_to_sql(cost.read_count)?,
            &u64_to_sql(cost.read_length)?,
            &u64_to_sql(cost.runtime)?,
            &u64_to_sql(cost.write_count)?,
            &u64_to_sql(cost.write_length)?,
            &u64_to_sql(ingest.txs.len() as u64)?,
        ];
        tx.execute(
            "INSERT INTO blocks
                (index_block_hash, block_hash, block_height, parent_index_block_hash, parent_block_hash,
                 parent_microblock_hash, parent_microblock_sequence, burn_block_height, burn_block_time,
                 burn_block_hash, execution_cost_read_count, execution_cost_read_length,
                 execution_cost_runtime, execution_cost_write_count, execution_cost_write_length,
                 tx_count, canonical, receive_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 0,
                 (SELECT COALESCE(MAX(receive_order), 0) + 1 FROM blocks))",
            args,
        )?;

        let placement = TxPlacement::anchored(block);
        for tx_data in ingest.txs.iter().filter(|t| t.microblock_hash.is_none()) {
            ChainStateDB::insert_tx(tx, tx_data, &placement)?;
            for event in ingest.events.iter().filter(|e| e.tx_id == tx_data.tx_id) {
                ChainStateDB::insert_event(tx, event, tx_data.tx_index, &placement)?;
            }
        }

        for reward in ingest.miner_rewards.iter() {
            ChainStateDB::insert_miner_reward(tx, &block.index_block_hash, reward)?;
        }

        Ok(())
    }

    fn insert_miner_reward(
        tx: &DBTx,
        index_block_hash: &StacksBlockId,
        reward: &MinerRewardData,
    ) -> Result<(), db_error> {
        let args: &[&dyn ToSql] = &[
            index_block_hash,
            &reward.from_index_block_hash,
            &u64_to_sql(reward.mature_block_height)?,
            &reward.recipient,
            &u64_to_sql(reward.coinbase_amount)?,
            &u64_to_sql(reward.tx_fees_anchored)?,
            &u64_to_sql(reward.tx_fees_streamed_confirmed)?,
            &u64_to_sql(reward.tx_fees_streamed_produced)?,
        ];
        tx.execute(
            "INSERT OR IGNORE INTO miner_rewards
                (index_block_hash, from_index_block_hash, mature_block_height, recipient,
                 coinbase_amount, tx_fees_anchored, tx_fees_streamed_confirmed,
                 tx_fees_streamed_produced, canonical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
            args,
        )?;
        Ok(())
    }

    /// Flip the canonical flag of a block and of every row that depends on it: its
    /// transactions and events (anchored or confirmed from the parent stream), the
    /// microblocks it confirmed, its miner rewards, and the not-yet-confirmed
    /// microblock stream built on top of it.
    pub fn set_block_canonical(
        tx: &DBTx,
        index_block_hash: &StacksBlockId,
        canonical: bool,
    ) -> Result<(), db_error> {
        tx.execute(
            "UPDATE blocks SET canonical = ?2 WHERE index_block_hash = ?1",
            params![index_block_hash, canonical],
        )?;
        let args = params![index_block_hash, canonical, UNCONFIRMED_INDEX_BLOCK_HASH];
        for table in ["txs", "events", "microblocks"] {
            let sql = format!(
                "UPDATE {table} SET canonical = ?2
                 WHERE index_block_hash = ?1
                    OR (index_block_hash = ?3 AND parent_index_block_hash = ?1)"
            );
            tx.execute(&sql, args)?;
        }
        tx.execute(
            "UPDATE miner_rewards SET canonical = ?2 WHERE index_block_hash = ?1",
            params![index_block_hash, canonical],
        )?;
        test_debug!("Set canonical"; "index_block_hash" => %index_block_hash, "canonical" => canonical);
        Ok(())
    }
}
