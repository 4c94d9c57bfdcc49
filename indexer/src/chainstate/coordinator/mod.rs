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

//! The single writer.  Every operation that changes the store runs in one immediate
//! transaction: rows are inserted, fork choice flips canonical flags, the mempool is
//! reconciled against the new canonical set, and the chain tip is recomputed.  Observers hear
//! about the write only once it has committed.

#[cfg(test)]
pub(crate) mod tests;

use hashbrown::HashSet;
use indexer_common::types::chainstate::{StacksBlockId, Txid};
use indexer_common::types::StacksAddress;

use crate::chainstate::db::{ChainStateDB, ChainTip};
use crate::chainstate::reorg::{FlipOutcome, ForkChoice};
use crate::chainstate::{BlockIngest, Error, MicroblockStream, TransactionStatus};
use crate::core::mempool::{
    MemPoolDB, MemPoolDropReason, MemPoolEvent, MemPoolEventBuffer, MempoolFilter,
    MempoolTxData, MempoolTxPage,
};
use crate::core::MEMPOOL_MAX_TRANSACTION_AGE;
use crate::event_dispatcher::{ChainEventObserver, EventDispatcher, ReconcileEvent};
use crate::monitoring;
use crate::util_lib::db::DBTx;

#[derive(Debug, Clone, PartialEq)]
pub struct ChainsCoordinatorConfig {
    /// Pruned mempool rows received this many blocks below the tip are deleted
    pub mempool_gc_threshold: u64,
    /// Pending mempool rows received this many blocks below the tip are dropped
    pub mempool_stale_threshold: Option<u64>,
    /// Refuse reorgs that roll back or apply more blocks than this
    pub max_reorg_depth: Option<u64>,
}

impl ChainsCoordinatorConfig {
    pub fn new() -> ChainsCoordinatorConfig {
        ChainsCoordinatorConfig {
            mempool_gc_threshold: MEMPOOL_MAX_TRANSACTION_AGE,
            mempool_stale_threshold: None,
            max_reorg_depth: None,
        }
    }
}

impl Default for ChainsCoordinatorConfig {
    fn default() -> ChainsCoordinatorConfig {
        ChainsCoordinatorConfig::new()
    }
}

/// Where a transaction stands, from the chain tables and the mempool together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxStatusInfo {
    pub tx_id: Txid,
    pub status: TransactionStatus,
    /// Visible on the canonical chain
    pub canonical: bool,
    /// Only streamed in a microblock so far
    pub is_unanchored: bool,
    pub in_mempool: bool,
    pub replaced_by_tx_id: Option<Txid>,
    pub index_block_hash: Option<StacksBlockId>,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressNonces {
    pub last_executed_tx_nonce: Option<u64>,
    pub last_mempool_tx_nonce: Option<u64>,
    pub possible_next_nonce: u64,
    /// Gaps between the last executed nonce and the highest pending one, highest first
    pub detected_missing_nonces: Vec<u64>,
    pub detected_mempool_nonces: Vec<u64>,
}

pub struct ChainStateCoordinator {
    chainstate: ChainStateDB,
    dispatcher: EventDispatcher,
    config: ChainsCoordinatorConfig,
}

/// Canonical-set difference over a set of candidate txids.
struct VisibilityChange {
    orphaned: Vec<Txid>,
    newly_confirmed: Vec<Txid>,
}

impl VisibilityChange {
    fn between(before: &HashSet<Txid>, after: &HashSet<Txid>) -> VisibilityChange {
        let mut orphaned: Vec<Txid> = before.difference(after).copied().collect();
        let mut newly_confirmed: Vec<Txid> = after.difference(before).copied().collect();
        orphaned.sort();
        newly_confirmed.sort();
        VisibilityChange {
            orphaned,
            newly_confirmed,
        }
    }
}

impl ChainStateCoordinator {
    pub fn new(chainstate: ChainStateDB, config: ChainsCoordinatorConfig) -> ChainStateCoordinator {
        ChainStateCoordinator {
            chainstate,
            dispatcher: EventDispatcher::new(),
            config,
        }
    }

    pub fn chainstate(&self) -> &ChainStateDB {
        &self.chainstate
    }

    pub fn config(&self) -> &ChainsCoordinatorConfig {
        &self.config
    }

    /// Subscribe to committed changes.
    pub fn register_observer(&mut self, observer: Box<dyn ChainEventObserver>) {
        self.dispatcher.register_observer(observer);
    }

    /// Ingest one anchored block.  Re-ingesting a block already stored with the same contents
    /// changes nothing and yields an empty event.
    pub fn apply_block(&mut self, ingest: &BlockIngest) -> Result<ReconcileEvent, Error> {
        monitoring::increment_stx_blocks_received_counter();
        let (event, mempool_events) = self
            .inner_apply_block(ingest)
            .inspect_err(|e| ChainStateCoordinator::log_rejection("block", e))?;

        if event.is_reorg() {
            monitoring::record_reorg(event.rolled_back_blocks.len() as u64);
        }
        ChainStateCoordinator::update_tip_metrics(&event.tip);
        self.dispatcher.publish(&event, &mempool_events);
        Ok(event)
    }

    fn inner_apply_block(
        &mut self,
        ingest: &BlockIngest,
    ) -> Result<(ReconcileEvent, Vec<MemPoolEvent>), Error> {
        let block = &ingest.block;
        let tx = self.chainstate.tx_begin()?;

        if let Some(existing) = ChainStateDB::get_block(&tx, &block.index_block_hash)? {
            if !ChainStateDB::is_same_block(&tx, &existing, ingest)? {
                return Err(Error::DuplicateBlock(block.index_block_hash));
            }
            debug!("Block already ingested"; "index_block_hash" => %block.index_block_hash);
            let tip = ChainStateDB::get_chain_tip(&tx)?;
            return Ok((ReconcileEvent::empty(tip), vec![]));
        }

        ChainStateCoordinator::validate_block(&tx, ingest)?;
        let choice = ForkChoice::plan(&tx, block, self.config.max_reorg_depth)?;

        let mut candidates: Vec<Txid> = ingest.txs.iter().map(|t| t.tx_id).collect();
        candidates.extend(ChainStateDB::get_txids_for_blocks(
            &tx,
            &choice.affected_blocks(block),
        )?);
        let before = ChainStateDB::get_visible_txids(&tx, &candidates)?;

        ChainStateDB::insert_block(&tx, ingest)?;
        ChainStateDB::accept_parent_microblocks(&tx, ingest)?;
        let flips = choice.apply(&tx, block)?;

        let after = ChainStateDB::get_visible_txids(&tx, &candidates)?;
        let change = VisibilityChange::between(&before, &after);

        let buffer = MemPoolEventBuffer::new();
        let chain_height = ChainStateCoordinator::canonical_height(&tx)?;
        MemPoolDB::reconcile_on_reorg(
            &tx,
            &change.orphaned,
            &change.newly_confirmed,
            chain_height,
            Some(&buffer),
        )?;
        if !flips.applied.is_empty() {
            MemPoolDB::garbage_collect(
                &tx,
                chain_height,
                self.config.mempool_gc_threshold,
                self.config.mempool_stale_threshold,
                Some(&buffer),
            )?;
        }

        let tip = ChainStateDB::update_chain_tip(&tx)?;
        tx.commit()?;

        let FlipOutcome {
            applied,
            rolled_back,
            orphaned_microblocks,
        } = flips;
        info!("Applied block";
              "index_block_hash" => %block.index_block_hash,
              "block_height" => block.block_height,
              "canonical" => !applied.is_empty(),
              "rolled_back" => rolled_back.len(),
              "orphaned_txs" => change.orphaned.len(),
              "confirmed_txs" => change.newly_confirmed.len());

        let event = ReconcileEvent {
            applied_blocks: applied.iter().map(|b| b.to_identifier()).collect(),
            rolled_back_blocks: rolled_back.iter().map(|b| b.to_identifier()).collect(),
            applied_microblocks: vec![],
            orphaned_microblocks,
            tip,
        };
        Ok((event, buffer.take()))
    }

    /// Structural checks that need the store: the parent must be known and one block lower.
    fn validate_block(tx: &DBTx, ingest: &BlockIngest) -> Result<(), Error> {
        let block = &ingest.block;
        if block.parent_index_block_hash.is_zero() {
            if block.block_height != 1 {
                return Err(Error::InvalidBlockHeight(
                    block.index_block_hash,
                    1,
                    block.block_height,
                ));
            }
        } else {
            let parent = ChainStateDB::get_block(tx, &block.parent_index_block_hash)?
                .ok_or(Error::UnknownParentBlock(block.parent_index_block_hash))?;
            let expected = parent.block_height() + 1;
            if block.block_height != expected {
                return Err(Error::InvalidBlockHeight(
                    block.index_block_hash,
                    expected,
                    block.block_height,
                ));
            }
        }

        let mut txids = HashSet::new();
        for tx_data in ingest.txs.iter() {
            if !txids.insert(tx_data.tx_id) {
                return Err(Error::InvalidData(format!(
                    "transaction {} appears twice in block {}",
                    tx_data.tx_id, block.index_block_hash
                )));
            }
            if tx_data.microblock_hash.is_some() && !block.confirms_microblocks() {
                return Err(Error::InvalidData(format!(
                    "transaction {} is streamed but block {} confirms no microblocks",
                    tx_data.tx_id, block.index_block_hash
                )));
            }
        }
        if let Some(event) = ingest.events.iter().find(|e| !txids.contains(&e.tx_id)) {
            return Err(Error::InvalidData(format!(
                "event {} names transaction {} not in block {}",
                event.event_index, event.tx_id, block.index_block_hash
            )));
        }
        Ok(())
    }

    /// Ingest a batch of unconfirmed microblocks.
    pub fn apply_microblocks(&mut self, stream: &MicroblockStream) -> Result<ReconcileEvent, Error> {
        for _ in stream.microblocks.iter() {
            monitoring::increment_stx_micro_blocks_received_counter();
        }
        let (event, mempool_events) = self
            .inner_apply_microblocks(stream)
            .inspect_err(|e| ChainStateCoordinator::log_rejection("microblocks", e))?;

        ChainStateCoordinator::update_tip_metrics(&event.tip);
        self.dispatcher.publish(&event, &mempool_events);
        Ok(event)
    }

    fn inner_apply_microblocks(
        &mut self,
        stream: &MicroblockStream,
    ) -> Result<(ReconcileEvent, Vec<MemPoolEvent>), Error> {
        let anchor_id = stream.parent_index_block_hash;
        let tx = self.chainstate.tx_begin()?;
        let anchor =
            ChainStateDB::get_block(&tx, &anchor_id)?.ok_or(Error::UnknownParentBlock(anchor_id))?;

        let mut candidates: Vec<Txid> = stream.txs.iter().map(|t| t.tx_id).collect();
        candidates.extend(ChainStateDB::get_txids_for_blocks(&tx, &[anchor_id])?);
        let before = ChainStateDB::get_visible_txids(&tx, &candidates)?;

        let stored = ChainStateDB::insert_microblock_stream(&tx, stream)?;

        let after = ChainStateDB::get_visible_txids(&tx, &candidates)?;
        let change = VisibilityChange::between(&before, &after);
        let buffer = MemPoolEventBuffer::new();
        let chain_height = ChainStateCoordinator::canonical_height(&tx)?;
        MemPoolDB::reconcile_on_reorg(
            &tx,
            &change.orphaned,
            &change.newly_confirmed,
            chain_height,
            Some(&buffer),
        )?;

        let tip = ChainStateDB::update_chain_tip(&tx)?;
        tx.commit()?;

        debug!("Applied microblocks";
               "anchor" => %anchor_id,
               "stored" => stored.len(),
               "confirmed_txs" => change.newly_confirmed.len());

        let applied_microblocks = if anchor.canonical {
            stored
                .iter()
                .filter(|m| m.microblock_canonical)
                .map(|m| m.microblock_hash)
                .collect()
        } else {
            vec![]
        };
        let event = ReconcileEvent {
            applied_microblocks,
            ..ReconcileEvent::empty(tip)
        };
        Ok((event, buffer.take()))
    }

    /// Add transactions received by the node's mempool.
    pub fn submit_mempool_txs(&mut self, txs: &[MempoolTxData]) -> Result<(), Error> {
        let buffer = MemPoolEventBuffer::new();
        let tx = self.chainstate.tx_begin()?;
        let chain_height = ChainStateCoordinator::canonical_height(&tx)?;
        MemPoolDB::submit(&tx, txs, chain_height, Some(&buffer))?;
        let tip = ChainStateDB::update_chain_tip(&tx)?;
        tx.commit()?;

        ChainStateCoordinator::update_tip_metrics(&tip);
        self.dispatcher.publish_mempool_events(&buffer.take());
        Ok(())
    }

    /// Drop mempool transactions on the node's say-so.
    pub fn drop_mempool_txs(
        &mut self,
        txids: &[Txid],
        reason: MemPoolDropReason,
        new_txid: Option<Txid>,
    ) -> Result<(), Error> {
        let buffer = MemPoolEventBuffer::new();
        let tx = self.chainstate.tx_begin()?;
        MemPoolDB::drop_txs(&tx, txids, reason, new_txid.as_ref(), Some(&buffer))?;
        let tip = ChainStateDB::update_chain_tip(&tx)?;
        tx.commit()?;

        ChainStateCoordinator::update_tip_metrics(&tip);
        self.dispatcher.publish_mempool_events(&buffer.take());
        Ok(())
    }

    /// Run the mempool garbage collector against the current tip.  Returns how many rows
    /// were deleted.
    pub fn garbage_collect_mempool(&mut self) -> Result<u64, Error> {
        let buffer = MemPoolEventBuffer::new();
        let tx = self.chainstate.tx_begin()?;
        let chain_height = ChainStateCoordinator::canonical_height(&tx)?;
        let deleted = MemPoolDB::garbage_collect(
            &tx,
            chain_height,
            self.config.mempool_gc_threshold,
            self.config.mempool_stale_threshold,
            Some(&buffer),
        )?;
        let tip = ChainStateDB::update_chain_tip(&tx)?;
        tx.commit()?;

        ChainStateCoordinator::update_tip_metrics(&tip);
        self.dispatcher.publish_mempool_events(&buffer.take());
        Ok(deleted)
    }

    pub fn get_chain_tip(&self) -> Result<ChainTip, Error> {
        Ok(ChainStateDB::get_chain_tip(self.chainstate.conn())?)
    }

    pub fn get_mempool_tx_list(
        &self,
        filter: &MempoolFilter,
        limit: u32,
        offset: u32,
    ) -> Result<MempoolTxPage, Error> {
        Ok(MemPoolDB::get_mempool_tx_list(
            self.chainstate.conn(),
            filter,
            limit,
            offset,
        )?)
    }

    pub fn get_address_etag(&self, address: &str) -> Result<String, Error> {
        Ok(ChainStateDB::get_address_etag(self.chainstate.conn(), address)?)
    }

    /// A canonical chain row wins; otherwise a live or dropped mempool row; otherwise the
    /// most recent non-canonical chain row.
    pub fn get_tx_status(
        &self,
        txid: &Txid,
        include_unanchored: bool,
    ) -> Result<Option<TxStatusInfo>, Error> {
        let conn = self.chainstate.conn();
        if let Some(info) = ChainStateDB::get_visible_tx(conn, txid, include_unanchored)? {
            let in_mempool = MemPoolDB::db_has_tx(conn, txid)?;
            return Ok(Some(TxStatusInfo {
                tx_id: *txid,
                status: info.status,
                canonical: true,
                is_unanchored: info.is_unanchored(),
                in_mempool,
                replaced_by_tx_id: None,
                index_block_hash: (!info.is_unanchored()).then_some(info.index_block_hash),
                block_height: Some(info.block_height),
            }));
        }

        let mempool_row = MemPoolDB::get_tx(conn, txid)?;
        if let Some(row) = mempool_row.as_ref() {
            // pruned but still pending means confirmed, which the chain rows describe better
            if !row.pruned || row.status.is_dropped() {
                return Ok(Some(TxStatusInfo {
                    tx_id: *txid,
                    status: row.status,
                    canonical: false,
                    is_unanchored: false,
                    in_mempool: true,
                    replaced_by_tx_id: row.replaced_by_tx_id,
                    index_block_hash: None,
                    block_height: None,
                }));
            }
        }

        if let Some(info) = ChainStateDB::get_latest_tx_row(conn, txid)? {
            return Ok(Some(TxStatusInfo {
                tx_id: *txid,
                status: info.status,
                canonical: false,
                is_unanchored: info.is_unanchored(),
                in_mempool: mempool_row.is_some(),
                replaced_by_tx_id: None,
                index_block_hash: (!info.is_unanchored()).then_some(info.index_block_hash),
                block_height: Some(info.block_height),
            }));
        }

        Ok(mempool_row.map(|row| TxStatusInfo {
            tx_id: *txid,
            status: row.status,
            canonical: false,
            is_unanchored: false,
            in_mempool: true,
            replaced_by_tx_id: row.replaced_by_tx_id,
            index_block_hash: None,
            block_height: None,
        }))
    }

    /// Nonce bookkeeping for wallets: what the chain has executed, what the mempool holds,
    /// and which nonces in between are missing.
    pub fn get_address_nonces(
        &self,
        address: &StacksAddress,
        include_unanchored: bool,
    ) -> Result<AddressNonces, Error> {
        let conn = self.chainstate.conn();
        let last_executed_tx_nonce =
            ChainStateDB::get_last_executed_nonce(conn, address, include_unanchored)?;
        let pending: Vec<u64> = MemPoolDB::get_pending_nonces(conn, address)?
            .into_iter()
            .filter(|n| last_executed_tx_nonce.map_or(true, |last| *n > last))
            .collect();
        let last_mempool_tx_nonce = pending.last().copied();

        let possible_next_nonce = match (last_executed_tx_nonce, last_mempool_tx_nonce) {
            (_, Some(mempool)) => mempool.saturating_add(1),
            (Some(executed), None) => executed.saturating_add(1),
            (None, None) => 0,
        };

        let mut detected_missing_nonces = vec![];
        if let Some(highest) = last_mempool_tx_nonce {
            let lowest = last_executed_tx_nonce.map_or(0, |n| n.saturating_add(1));
            let present: HashSet<u64> = pending.iter().copied().collect();
            detected_missing_nonces = (lowest..highest)
                .rev()
                .filter(|n| !present.contains(n))
                .collect();
        }

        Ok(AddressNonces {
            last_executed_tx_nonce,
            last_mempool_tx_nonce,
            possible_next_nonce,
            detected_missing_nonces,
            detected_mempool_nonces: pending,
        })
    }

    fn canonical_height(tx: &DBTx) -> Result<u64, Error> {
        Ok(ChainStateDB::get_canonical_tip_block(tx)?.map_or(0, |b| b.block_height()))
    }

    fn update_tip_metrics(tip: &ChainTip) {
        monitoring::update_stacks_tip_height(i64::try_from(tip.block_height).unwrap_or(i64::MAX));
        monitoring::update_mempool_size(i64::try_from(tip.mempool_tx_count).unwrap_or(i64::MAX));
    }

    fn log_rejection(what: &str, e: &Error) {
        if e.is_transient() {
            warn!("Store unavailable, input not applied"; "input" => what, "error" => %e);
        } else {
            monitoring::increment_rejected_inputs_counter();
            warn!("Rejected input"; "input" => what, "error" => %e);
        }
    }
}
