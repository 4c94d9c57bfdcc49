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

use std::cell::RefCell;
use std::rc::Rc;

use indexer_common::types::chainstate::{BlockHeaderHash, BurnchainHeaderHash, StacksBlockId, Txid};

use super::*;
use crate::chainstate::{
    BlockData, ExecutionCost, MicroblockData, TransactionData, TransactionType,
};
use crate::core::mempool::tests::{make_mempool_tx, SENDER, SPONSOR};
use crate::event_dispatcher::ObserverError;
use crate::util_lib::db::{query_count, DBConn};

pub fn make_block(height: u64, id: u8, parent: u8) -> BlockIngest {
    BlockIngest {
        block: BlockData {
            index_block_hash: StacksBlockId([id; 32]),
            block_hash: BlockHeaderHash([id; 32]),
            block_height: height,
            parent_index_block_hash: StacksBlockId([parent; 32]),
            parent_block_hash: BlockHeaderHash([parent; 32]),
            parent_microblock_hash: BlockHeaderHash::sentinel(),
            parent_microblock_sequence: 0,
            burn_block_height: 100 + height,
            burn_block_time: 1_600_000_000 + height * 600,
            burn_block_hash: BurnchainHeaderHash([id; 32]),
            execution_cost: ExecutionCost::default(),
        },
        txs: vec![],
        microblocks: vec![],
        miner_rewards: vec![],
        events: vec![],
    }
}

pub fn make_tx(txid_byte: u8, sender: &str, nonce: u64, fee: u64) -> TransactionData {
    TransactionData {
        tx_id: Txid([txid_byte; 32]),
        tx_index: 0,
        tx_type: TransactionType::TokenTransfer,
        raw_tx: format!("0x{:02x}", txid_byte),
        sender_address: sender.parse().unwrap(),
        nonce,
        sponsor_address: None,
        sponsor_nonce: None,
        fee_rate: fee,
        status: TransactionStatus::Success,
        token_transfer_recipient: Some("SP000000000000000000002Q6VF78".to_string()),
        contract_id: None,
        microblock_hash: None,
    }
}

pub fn make_microblock(
    anchor: &BlockData,
    hash_byte: u8,
    seq: u32,
    parent: Option<&MicroblockData>,
) -> MicroblockData {
    MicroblockData {
        microblock_hash: BlockHeaderHash([hash_byte; 32]),
        microblock_sequence: seq,
        microblock_parent_hash: parent.map_or(anchor.block_hash, |p| p.microblock_hash),
        parent_index_block_hash: anchor.index_block_hash,
        receive_time: 1_600_000_000 + u64::from(seq),
    }
}

fn make_coordinator(config: ChainsCoordinatorConfig) -> (ChainStateCoordinator, EventLog) {
    let mut coord = ChainStateCoordinator::new(ChainStateDB::open_test(), config);
    let log = EventLog::default();
    coord.register_observer(Box::new(log.clone()));
    (coord, log)
}

#[derive(Clone, Default)]
struct EventLog {
    reconciles: Rc<RefCell<Vec<ReconcileEvent>>>,
    mempool: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    fn last(&self) -> ReconcileEvent {
        self.reconciles.borrow().last().cloned().unwrap()
    }

    fn take_mempool(&self) -> Vec<String> {
        self.mempool.take()
    }
}

impl ChainEventObserver for EventLog {
    fn on_reconcile(&self, event: &ReconcileEvent) -> Result<(), ObserverError> {
        self.reconciles.borrow_mut().push(event.clone());
        Ok(())
    }

    fn on_mempool_txs_admitted(&self, txids: &[Txid]) -> Result<(), ObserverError> {
        for txid in txids.iter() {
            self.mempool
                .borrow_mut()
                .push(format!("admitted {:02x}", txid.0[0]));
        }
        Ok(())
    }

    fn on_mempool_txs_dropped(
        &self,
        txids: &[Txid],
        new_txid: Option<&Txid>,
        reason: MemPoolDropReason,
    ) -> Result<(), ObserverError> {
        for txid in txids.iter() {
            let by = new_txid.map_or("none".to_string(), |t| format!("{:02x}", t.0[0]));
            self.mempool
                .borrow_mut()
                .push(format!("dropped {:02x} {reason} {by}", txid.0[0]));
        }
        Ok(())
    }
}

struct BrokenObserver;

impl ChainEventObserver for BrokenObserver {
    fn on_reconcile(&self, _event: &ReconcileEvent) -> Result<(), ObserverError> {
        Err("observer endpoint is down".into())
    }
}

fn ids(blocks: &[crate::event_dispatcher::BlockIdentifier]) -> Vec<u8> {
    blocks.iter().map(|b| b.index_block_hash.0[0]).collect()
}

fn is_canonical(coord: &ChainStateCoordinator, id: u8) -> bool {
    ChainStateDB::get_block(coord.chainstate().conn(), &StacksBlockId([id; 32]))
        .unwrap()
        .unwrap()
        .canonical
}

fn mempool_row(coord: &ChainStateCoordinator, txid_byte: u8) -> crate::core::mempool::MemPoolTxInfo {
    MemPoolDB::get_tx(coord.chainstate().conn(), &Txid([txid_byte; 32]))
        .unwrap()
        .unwrap()
}

/// Checks every property that must hold between any two writes.
fn assert_chain_invariants(conn: &DBConn) {
    // one canonical block per height
    assert_eq!(
        query_count(
            conn,
            "SELECT COUNT(*) FROM (SELECT block_height FROM blocks WHERE canonical = 1
             GROUP BY block_height HAVING COUNT(*) > 1)",
            []
        )
        .unwrap(),
        0
    );

    // the canonical chain is connected down to genesis
    let canonical_count =
        query_count(conn, "SELECT COUNT(*) FROM blocks WHERE canonical = 1", []).unwrap();
    let mut walked = 0;
    let mut cursor = ChainStateDB::get_canonical_tip_block(conn)
        .unwrap()
        .map(|b| b.block.index_block_hash);
    while let Some(id) = cursor {
        let block = ChainStateDB::get_block(conn, &id).unwrap().unwrap();
        assert!(block.canonical, "non-canonical block {id} below the tip");
        walked += 1;
        cursor = Some(block.block.parent_index_block_hash).filter(|p| !p.is_zero());
    }
    assert_eq!(walked, canonical_count);

    // dependent rows carry their block's flag
    for table in ["txs", "events", "microblocks", "miner_rewards"] {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} JOIN blocks
                ON {table}.index_block_hash = blocks.index_block_hash
             WHERE {table}.canonical != blocks.canonical"
        );
        assert_eq!(query_count(conn, &sql, []).unwrap(), 0, "{table}");
    }

    // at most one live transaction per nonce slot
    for (addr, nonce) in [("sender_address", "nonce"), ("payer_address", "payer_nonce")] {
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT {addr}, {nonce} FROM mempool_txs WHERE pruned = 0
             GROUP BY {addr}, {nonce} HAVING COUNT(*) > 1)"
        );
        assert_eq!(query_count(conn, &sql, []).unwrap(), 0, "{addr}");
    }
}

#[test]
fn test_extend_sibling_and_reorg() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());

    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    let event = coord.apply_block(&make_block(2, 0x02, 0x01)).unwrap();
    assert_eq!(ids(&event.applied_blocks), vec![0x02]);
    assert!(event.rolled_back_blocks.is_empty());
    let tip = coord.get_chain_tip().unwrap();
    assert_eq!(tip.block_height, 2);
    assert_eq!(tip.index_block_hash, StacksBlockId([0x02; 32]));
    assert!(is_canonical(&coord, 0x01) && is_canonical(&coord, 0x02));

    // equal height: stored, but the first one received stays canonical
    let event = coord.apply_block(&make_block(2, 0xbb, 0x01)).unwrap();
    assert!(event.applied_blocks.is_empty());
    assert!(event.rolled_back_blocks.is_empty());
    assert!(!is_canonical(&coord, 0xbb));
    assert_eq!(event.tip.index_block_hash, StacksBlockId([0x02; 32]));
    let conn = coord.chainstate().conn();
    let at_two: Vec<_> = ChainStateDB::get_blocks_at_height(conn, 2)
        .unwrap()
        .into_iter()
        .map(|b| b.block.index_block_hash)
        .collect();
    assert_eq!(at_two, vec![StacksBlockId([0x02; 32]), StacksBlockId([0xbb; 32])]);
    assert_chain_invariants(conn);

    let event = coord.apply_block(&make_block(3, 0x03, 0xbb)).unwrap();
    assert_eq!(ids(&event.rolled_back_blocks), vec![0x02]);
    assert_eq!(ids(&event.applied_blocks), vec![0xbb, 0x03]);
    assert_eq!(event.tip.index_block_hash, StacksBlockId([0x03; 32]));
    assert!(!is_canonical(&coord, 0x02));
    assert!(is_canonical(&coord, 0xbb));
    let canonical_two =
        ChainStateDB::get_canonical_block_at_height(coord.chainstate().conn(), 2).unwrap();
    assert_eq!(
        canonical_two.map(|b| b.block.index_block_hash),
        Some(StacksBlockId([0xbb; 32]))
    );
    assert_chain_invariants(coord.chainstate().conn());

    // one event per call, the tip version strictly increasing
    let events = log.reconciles.borrow();
    assert_eq!(events.len(), 4);
    assert!(events.windows(2).all(|w| w[0].tip.version < w[1].tip.version));
}

#[test]
fn test_replace_by_fee_then_confirm_then_revive() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();

    coord
        .submit_mempool_txs(&[make_mempool_tx(0xaa, SENDER, 1, 200)])
        .unwrap();
    coord
        .submit_mempool_txs(&[make_mempool_tx(0xbb, SENDER, 1, 300)])
        .unwrap();
    let a = mempool_row(&coord, 0xaa);
    assert_eq!(a.status, TransactionStatus::DroppedReplaceByFee);
    assert_eq!(a.replaced_by_tx_id, Some(Txid([0xbb; 32])));
    let page = coord
        .get_mempool_tx_list(&MempoolFilter::default(), 20, 0)
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.results[0].tx_id, Txid([0xbb; 32]));
    assert_eq!(coord.get_chain_tip().unwrap().mempool_tx_count, 1);
    assert_eq!(
        log.take_mempool(),
        vec![
            "admitted aa",
            "admitted bb",
            "dropped aa ReplaceByFee bb"
        ]
    );

    // C spends the same nonce on chain without ever being in the mempool
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.txs.push(make_tx(0xcc, SENDER, 1, 100));
    coord.apply_block(&b2).unwrap();
    for txid_byte in [0xaa, 0xbb] {
        let row = mempool_row(&coord, txid_byte);
        assert!(row.pruned);
        assert_eq!(row.status, TransactionStatus::DroppedReplaceByFee);
        assert_eq!(row.replaced_by_tx_id, Some(Txid([0xcc; 32])));
    }
    assert_eq!(log.take_mempool(), vec!["dropped bb ReplaceByFee cc"]);
    assert_eq!(coord.get_chain_tip().unwrap().mempool_tx_count, 0);

    // a longer fork without C: B has the highest fee of the three and comes back
    coord.apply_block(&make_block(2, 0x22, 0x01)).unwrap();
    let event = coord.apply_block(&make_block(3, 0x23, 0x22)).unwrap();
    assert_eq!(ids(&event.rolled_back_blocks), vec![0x02]);

    let b = mempool_row(&coord, 0xbb);
    assert!(!b.pruned);
    assert_eq!(b.status, TransactionStatus::Pending);
    assert_eq!(b.replaced_by_tx_id, None);
    for txid_byte in [0xaa, 0xcc] {
        let row = mempool_row(&coord, txid_byte);
        assert!(row.pruned);
        assert_eq!(row.status, TransactionStatus::DroppedReplaceByFee);
        assert_eq!(row.replaced_by_tx_id, Some(Txid([0xbb; 32])));
    }
    let mut mempool_events = log.take_mempool();
    mempool_events.sort();
    assert_eq!(
        mempool_events,
        vec![
            "admitted bb",
            "dropped aa ReplaceByFee bb",
            "dropped cc ReplaceByFee bb"
        ]
    );

    let status = coord
        .get_tx_status(&Txid([0xcc; 32]), false)
        .unwrap()
        .unwrap();
    assert!(!status.canonical);
    assert_eq!(status.status, TransactionStatus::DroppedReplaceByFee);
    assert_eq!(status.replaced_by_tx_id, Some(Txid([0xbb; 32])));
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_revival_without_competition() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.txs.push(make_tx(0x40, SENDER, 0, 10));
    coord.apply_block(&b2).unwrap();

    let status = coord
        .get_tx_status(&Txid([0x40; 32]), false)
        .unwrap()
        .unwrap();
    assert!(status.canonical);
    assert_eq!(status.status, TransactionStatus::Success);
    assert_eq!(status.index_block_hash, Some(StacksBlockId([0x02; 32])));

    coord.apply_block(&make_block(2, 0x32, 0x01)).unwrap();
    coord.apply_block(&make_block(3, 0x33, 0x32)).unwrap();
    let revived = mempool_row(&coord, 0x40);
    assert!(!revived.pruned);
    assert_eq!(revived.status, TransactionStatus::Pending);
    assert_eq!(revived.receipt_block_height, 3);
    assert_eq!(log.take_mempool(), vec!["admitted 40"]);

    // reorg back: the original block is extended past the new fork
    coord.apply_block(&make_block(3, 0x03, 0x02)).unwrap();
    let event = coord.apply_block(&make_block(4, 0x04, 0x03)).unwrap();
    assert_eq!(ids(&event.rolled_back_blocks), vec![0x33, 0x32]);
    assert_eq!(ids(&event.applied_blocks), vec![0x02, 0x03, 0x04]);
    let confirmed = mempool_row(&coord, 0x40);
    assert!(confirmed.pruned);
    assert_eq!(confirmed.status, TransactionStatus::Pending);
    let status = coord
        .get_tx_status(&Txid([0x40; 32]), false)
        .unwrap()
        .unwrap();
    assert!(status.canonical);
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_revived_tx_replaced_across_fork() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.txs.push(make_tx(0x50, SENDER, 0, 10));
    coord.apply_block(&b2).unwrap();

    // the winning fork spends the same nonce with a different transaction
    let mut b2x = make_block(2, 0x52, 0x01);
    b2x.txs.push(make_tx(0x51, SENDER, 0, 5));
    coord.apply_block(&b2x).unwrap();
    coord.apply_block(&make_block(3, 0x53, 0x52)).unwrap();

    let orphan = mempool_row(&coord, 0x50);
    assert!(orphan.pruned);
    assert_eq!(orphan.status, TransactionStatus::DroppedReplaceAcrossFork);
    assert_eq!(orphan.replaced_by_tx_id, Some(Txid([0x51; 32])));
    assert_eq!(
        log.take_mempool(),
        vec!["dropped 50 ReplaceAcrossFork 51"]
    );
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_duplicate_and_invalid_blocks() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    let b1 = make_block(1, 0x01, 0x00);
    coord.apply_block(&b1).unwrap();
    let version = coord.get_chain_tip().unwrap().version;

    // replay is a no-op, but still announced
    let event = coord.apply_block(&b1).unwrap();
    assert!(event.is_empty());
    assert_eq!(event.tip.version, version);
    assert_eq!(log.reconciles.borrow().len(), 2);

    let mut altered = b1.clone();
    altered.block.burn_block_time += 1;
    assert!(matches!(
        coord.apply_block(&altered),
        Err(Error::DuplicateBlock(_))
    ));

    assert!(matches!(
        coord.apply_block(&make_block(3, 0x03, 0x02)),
        Err(Error::UnknownParentBlock(id)) if id == StacksBlockId([0x02; 32])
    ));
    assert!(matches!(
        coord.apply_block(&make_block(3, 0x02, 0x01)),
        Err(Error::InvalidBlockHeight(_, 2, 3))
    ));

    let mut orphan_event = make_block(2, 0x02, 0x01);
    orphan_event.events.push(crate::chainstate::EventData {
        tx_id: Txid([0x99; 32]),
        event_index: 0,
        event_type: crate::chainstate::AssetEventType::StxTransfer,
        asset_identifier: None,
        sender: Some(SENDER.to_string()),
        recipient: Some(SPONSOR.to_string()),
        amount: Some("10".to_string()),
        value: None,
        contract_identifier: None,
        topic: None,
    });
    assert!(matches!(
        coord.apply_block(&orphan_event),
        Err(Error::InvalidData(_))
    ));

    // nothing from the failed calls is visible, and failures are not announced
    assert_eq!(coord.get_chain_tip().unwrap().version, version);
    assert!(!ChainStateDB::has_block(coord.chainstate().conn(), &StacksBlockId([0x02; 32])).unwrap());
    assert_eq!(log.reconciles.borrow().len(), 2);
}

#[test]
fn test_reorg_depth_exceeded_leaves_store_untouched() {
    let config = ChainsCoordinatorConfig {
        max_reorg_depth: Some(1),
        ..ChainsCoordinatorConfig::new()
    };
    let (mut coord, _log) = make_coordinator(config);
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    coord.apply_block(&make_block(2, 0x02, 0x01)).unwrap();
    coord.apply_block(&make_block(3, 0x03, 0x02)).unwrap();
    coord.apply_block(&make_block(2, 0x12, 0x01)).unwrap();
    coord.apply_block(&make_block(3, 0x13, 0x12)).unwrap();

    let tip = coord.get_chain_tip().unwrap();
    let err = coord.apply_block(&make_block(4, 0x14, 0x13)).unwrap_err();
    assert!(matches!(err, Error::ReorgDepthExceeded(_, 1)));
    assert!(!err.is_transient());
    assert_eq!(coord.get_chain_tip().unwrap(), tip);
    assert!(is_canonical(&coord, 0x03));
}

#[test]
fn test_microblocks_confirm_then_orphan() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    let b1 = make_block(1, 0x01, 0x00);
    coord.apply_block(&b1).unwrap();
    coord
        .submit_mempool_txs(&[make_mempool_tx(0x31, SENDER, 1, 50)])
        .unwrap();
    log.take_mempool();

    let mb0 = make_microblock(&b1.block, 0xa0, 0, None);
    let mb1 = make_microblock(&b1.block, 0xa1, 1, Some(&mb0));
    let mut streamed = make_tx(0x30, SENDER, 0, 10);
    streamed.microblock_hash = Some(mb0.microblock_hash);
    let mut pending = make_tx(0x31, SENDER, 1, 50);
    pending.microblock_hash = Some(mb1.microblock_hash);

    let event = coord
        .apply_microblocks(&MicroblockStream {
            parent_index_block_hash: b1.block.index_block_hash,
            microblocks: vec![mb0.clone(), mb1.clone()],
            txs: vec![streamed, pending],
            events: vec![],
        })
        .unwrap();
    assert_eq!(
        event.applied_microblocks,
        vec![mb0.microblock_hash, mb1.microblock_hash]
    );
    assert_eq!(event.tip.microblock_hash, Some(mb1.microblock_hash));
    assert_eq!(event.tip.block_etag(), format!("{}:{}", b1.block.index_block_hash, mb1.microblock_hash));

    // streaming counts as confirmation for the mempool
    let row = mempool_row(&coord, 0x31);
    assert!(row.pruned);
    assert_eq!(row.status, TransactionStatus::Pending);
    let status = coord
        .get_tx_status(&Txid([0x31; 32]), true)
        .unwrap()
        .unwrap();
    assert!(status.canonical && status.is_unanchored);
    assert!(coord
        .get_tx_status(&Txid([0x31; 32]), false)
        .unwrap()
        .map_or(true, |s| !s.canonical));

    // the next block accepts only mb0
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.block.parent_microblock_hash = mb0.microblock_hash;
    b2.block.parent_microblock_sequence = 0;
    let event = coord.apply_block(&b2).unwrap();
    assert_eq!(event.orphaned_microblocks, vec![mb1.microblock_hash]);
    assert_eq!(event.tip.microblock_hash, None);

    let confirmed = coord
        .get_tx_status(&Txid([0x30; 32]), false)
        .unwrap()
        .unwrap();
    assert!(confirmed.canonical);
    assert_eq!(confirmed.index_block_hash, Some(StacksBlockId([0x02; 32])));

    let revived = mempool_row(&coord, 0x31);
    assert!(!revived.pruned);
    assert_eq!(log.take_mempool(), vec!["admitted 31"]);
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_microblocks_need_anchor() {
    let (mut coord, _log) = make_coordinator(ChainsCoordinatorConfig::new());
    let b1 = make_block(1, 0x01, 0x00);
    let mb0 = make_microblock(&b1.block, 0xa0, 0, None);
    let err = coord
        .apply_microblocks(&MicroblockStream {
            parent_index_block_hash: b1.block.index_block_hash,
            microblocks: vec![mb0],
            txs: vec![],
            events: vec![],
        })
        .unwrap_err();
    assert!(matches!(err, Error::UnknownParentBlock(_)));
}

#[test]
fn test_observer_failure_does_not_roll_back() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    coord.register_observer(Box::new(BrokenObserver));
    let event = coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    assert_eq!(ids(&event.applied_blocks), vec![0x01]);
    assert_eq!(coord.get_chain_tip().unwrap(), event.tip);
    assert_eq!(log.last(), event);
}

#[test]
fn test_mempool_gc_after_new_blocks() {
    let config = ChainsCoordinatorConfig {
        mempool_gc_threshold: 2,
        ..ChainsCoordinatorConfig::new()
    };
    let (mut coord, _log) = make_coordinator(config);
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    coord
        .submit_mempool_txs(&[
            make_mempool_tx(0x61, SENDER, 0, 10),
            make_mempool_tx(0x62, SENDER, 1, 10),
        ])
        .unwrap();
    coord
        .drop_mempool_txs(
            &[Txid([0x61; 32])],
            MemPoolDropReason::TOO_EXPENSIVE,
            None,
        )
        .unwrap();
    let dropped = coord
        .get_tx_status(&Txid([0x61; 32]), false)
        .unwrap()
        .unwrap();
    assert_eq!(dropped.status, TransactionStatus::DroppedTooExpensive);

    coord.apply_block(&make_block(2, 0x02, 0x01)).unwrap();
    coord.apply_block(&make_block(3, 0x03, 0x02)).unwrap();
    assert!(MemPoolDB::db_has_tx(coord.chainstate().conn(), &Txid([0x61; 32])).unwrap());
    coord.apply_block(&make_block(4, 0x04, 0x03)).unwrap();
    assert!(!MemPoolDB::db_has_tx(coord.chainstate().conn(), &Txid([0x61; 32])).unwrap());
    assert!(!mempool_row(&coord, 0x62).pruned);
    assert_eq!(coord.garbage_collect_mempool().unwrap(), 0);
}

#[test]
fn test_address_nonces() {
    let (mut coord, _log) = make_coordinator(ChainsCoordinatorConfig::new());
    let mut b1 = make_block(1, 0x01, 0x00);
    b1.txs.push(make_tx(0x70, SENDER, 0, 10));
    coord.apply_block(&b1).unwrap();
    coord
        .submit_mempool_txs(&[
            make_mempool_tx(0x72, SENDER, 2, 10),
            make_mempool_tx(0x74, SENDER, 4, 10),
        ])
        .unwrap();

    let nonces = coord
        .get_address_nonces(&SENDER.parse().unwrap(), false)
        .unwrap();
    assert_eq!(
        nonces,
        AddressNonces {
            last_executed_tx_nonce: Some(0),
            last_mempool_tx_nonce: Some(4),
            possible_next_nonce: 5,
            detected_missing_nonces: vec![3, 1],
            detected_mempool_nonces: vec![2, 4],
        }
    );

    let fresh = coord
        .get_address_nonces(&SPONSOR.parse().unwrap(), false)
        .unwrap();
    assert_eq!(fresh.possible_next_nonce, 0);
    assert!(fresh.detected_missing_nonces.is_empty());
}

/// Row counts and canonical row counts of every table a write can touch.
fn store_fingerprint(conn: &DBConn) -> Vec<u64> {
    let mut counts = vec![];
    for table in ["blocks", "txs", "events", "microblocks", "miner_rewards"] {
        counts.push(query_count(conn, &format!("SELECT COUNT(*) FROM {table}"), []).unwrap());
        counts.push(
            query_count(conn, &format!("SELECT COUNT(*) FROM {table} WHERE canonical = 1"), [])
                .unwrap(),
        );
    }
    counts.push(query_count(conn, "SELECT COUNT(*) FROM mempool_txs", []).unwrap());
    counts.push(query_count(conn, "SELECT COUNT(*) FROM mempool_txs WHERE pruned = 0", []).unwrap());
    counts
}

#[test]
fn test_bare_genesis_block() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    let event = coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    assert_eq!(ids(&event.applied_blocks), vec![0x01]);
    assert!(is_canonical(&coord, 0x01));

    let tip = coord.get_chain_tip().unwrap();
    assert_eq!(tip.block_height, 1);
    assert_eq!(tip.index_block_hash, StacksBlockId([0x01; 32]));
    assert!(tip.version > 0);
    assert_eq!(log.last().tip, tip);
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_same_block_id_with_other_txs() {
    let (mut coord, _log) = make_coordinator(ChainsCoordinatorConfig::new());
    let mut b1 = make_block(1, 0x01, 0x00);
    b1.txs.push(make_tx(0x20, SENDER, 0, 10));
    coord.apply_block(&b1).unwrap();
    let tip = coord.get_chain_tip().unwrap();

    // same header and transaction count, different transaction
    let mut swapped = b1.clone();
    swapped.txs[0] = make_tx(0x21, SENDER, 0, 10);
    assert!(matches!(
        coord.apply_block(&swapped),
        Err(Error::DuplicateBlock(id)) if id == StacksBlockId([0x01; 32])
    ));
    assert!(coord.get_tx_status(&Txid([0x21; 32]), false).unwrap().is_none());

    let event = coord.apply_block(&b1).unwrap();
    assert!(event.is_empty());
    assert_eq!(coord.get_chain_tip().unwrap(), tip);
}

#[test]
fn test_replayed_reorg_is_idempotent() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    let b1 = make_block(1, 0x01, 0x00);
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.txs.push(make_tx(0xd2, SENDER, 0, 10));
    let b3 = make_block(3, 0x03, 0x02);
    let b12 = make_block(2, 0x12, 0x01);
    let mut b13 = make_block(3, 0x13, 0x12);
    b13.txs.push(make_tx(0xd3, SPONSOR, 0, 10));
    let b14 = make_block(4, 0x14, 0x13);

    for block in [&b1, &b2, &b3, &b12, &b13] {
        coord.apply_block(block).unwrap();
    }
    let event = coord.apply_block(&b14).unwrap();
    assert_eq!(ids(&event.rolled_back_blocks), vec![0x03, 0x02]);
    assert_eq!(ids(&event.applied_blocks), vec![0x12, 0x13, 0x14]);
    assert_eq!(log.take_mempool(), vec!["admitted d2"]);

    let tip = coord.get_chain_tip().unwrap();
    let fingerprint = store_fingerprint(coord.chainstate().conn());
    let published = log.reconciles.borrow().len();

    // the same blocks again, in delivery order and out of it
    for block in [&b12, &b13, &b14, &b2, &b3, &b1] {
        let event = coord.apply_block(block).unwrap();
        assert!(event.is_empty());
        assert_eq!(event.tip, tip);
    }
    assert_eq!(coord.get_chain_tip().unwrap(), tip);
    assert_eq!(store_fingerprint(coord.chainstate().conn()), fingerprint);
    assert!(log.take_mempool().is_empty());

    // replays are announced, but never as a change
    let events = log.reconciles.borrow();
    assert_eq!(events.len(), published + 6);
    assert!(events[published..].iter().all(|e| e.is_empty() && e.tip.version == tip.version));
    drop(events);
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_micro_fork_later_microblock_confirmed() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    let b1 = make_block(1, 0x01, 0x00);
    coord.apply_block(&b1).unwrap();

    let mb_a = make_microblock(&b1.block, 0xa0, 0, None);
    let mut tx_a = make_tx(0x80, SENDER, 0, 10);
    tx_a.microblock_hash = Some(mb_a.microblock_hash);
    let event = coord
        .apply_microblocks(&MicroblockStream {
            parent_index_block_hash: b1.block.index_block_hash,
            microblocks: vec![mb_a.clone()],
            txs: vec![tx_a],
            events: vec![],
        })
        .unwrap();
    assert_eq!(event.applied_microblocks, vec![mb_a.microblock_hash]);

    // a second microblock at the same sequence is kept, but does not displace the first
    let mut mb_b = make_microblock(&b1.block, 0xb0, 0, None);
    mb_b.receive_time += 1;
    let mut tx_b = make_tx(0x81, SPONSOR, 0, 10);
    tx_b.microblock_hash = Some(mb_b.microblock_hash);
    let event = coord
        .apply_microblocks(&MicroblockStream {
            parent_index_block_hash: b1.block.index_block_hash,
            microblocks: vec![mb_b.clone()],
            txs: vec![tx_b],
            events: vec![],
        })
        .unwrap();
    assert!(event.applied_microblocks.is_empty());
    assert_eq!(event.tip.microblock_hash, Some(mb_a.microblock_hash));
    assert!(coord
        .get_tx_status(&Txid([0x81; 32]), true)
        .unwrap()
        .map_or(true, |s| !s.canonical));
    log.take_mempool();

    // the anchor settles the fork in favor of the microblock seen second
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.block.parent_microblock_hash = mb_b.microblock_hash;
    b2.block.parent_microblock_sequence = 0;
    let event = coord.apply_block(&b2).unwrap();
    assert_eq!(ids(&event.applied_blocks), vec![0x02]);
    assert_eq!(event.orphaned_microblocks, vec![mb_a.microblock_hash]);

    let confirmed = coord
        .get_tx_status(&Txid([0x81; 32]), false)
        .unwrap()
        .unwrap();
    assert!(confirmed.canonical);
    assert_eq!(confirmed.index_block_hash, Some(StacksBlockId([0x02; 32])));
    let accepted: Vec<_> =
        ChainStateDB::get_accepted_microblocks(coord.chainstate().conn(), &StacksBlockId([0x02; 32]))
            .unwrap()
            .into_iter()
            .map(|m| m.microblock.microblock_hash)
            .collect();
    assert_eq!(accepted, vec![mb_b.microblock_hash]);

    // the losing microblock's transaction goes back to the mempool
    let revived = mempool_row(&coord, 0x80);
    assert!(!revived.pruned);
    assert_eq!(revived.status, TransactionStatus::Pending);
    assert_eq!(log.take_mempool(), vec!["admitted 80"]);
    assert_chain_invariants(coord.chainstate().conn());
}

#[test]
fn test_revived_sponsored_tx_payer_taken_across_fork() {
    let (mut coord, log) = make_coordinator(ChainsCoordinatorConfig::new());
    coord.apply_block(&make_block(1, 0x01, 0x00)).unwrap();
    let mut sponsored = make_tx(0x90, SENDER, 0, 10);
    sponsored.sponsor_address = Some(SPONSOR.parse().unwrap());
    sponsored.sponsor_nonce = Some(3);
    let mut b2 = make_block(2, 0x02, 0x01);
    b2.txs.push(sponsored);
    coord.apply_block(&b2).unwrap();

    // the winning fork spends the sponsor's nonce as an origin nonce
    let mut b12 = make_block(2, 0x12, 0x01);
    b12.txs.push(make_tx(0x91, SPONSOR, 3, 10));
    coord.apply_block(&b12).unwrap();
    let event = coord.apply_block(&make_block(3, 0x13, 0x12)).unwrap();
    assert_eq!(ids(&event.rolled_back_blocks), vec![0x02]);

    let orphan = mempool_row(&coord, 0x90);
    assert!(orphan.pruned);
    assert_eq!(orphan.status, TransactionStatus::DroppedReplaceAcrossFork);
    assert_eq!(orphan.replaced_by_tx_id, Some(Txid([0x91; 32])));
    assert_eq!(log.take_mempool(), vec!["dropped 90 ReplaceAcrossFork 91"]);

    let status = coord
        .get_tx_status(&Txid([0x90; 32]), false)
        .unwrap()
        .unwrap();
    assert!(!status.canonical);
    assert_eq!(status.status, TransactionStatus::DroppedReplaceAcrossFork);
    assert_eq!(status.replaced_by_tx_id, Some(Txid([0x91; 32])));
    assert_chain_invariants(coord.chainstate().conn());
}
