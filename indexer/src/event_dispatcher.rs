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

//! Post-commit change notification.
//!
//! Every coordinator write produces one [`ReconcileEvent`].  It is handed to the registered
//! observers only after the store transaction has committed, together with whatever mempool
//! arrivals and drops the same write caused.  Observer failures are logged and otherwise
//! ignored: the reconciliation they describe is already durable, and delivery is
//! at-least-once.

use std::error;
use std::io::Write;
use std::sync::Mutex;

use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId, Txid};
use serde_json::json;

use crate::chainstate::db::ChainTip;
use crate::core::mempool::{MemPoolDropReason, MemPoolEvent};

pub const PATH_RECONCILE: &str = "reconcile";
pub const PATH_MEMPOOL_TX_SUBMIT: &str = "new_mempool_tx";
pub const PATH_MEMPOOL_TX_DROP: &str = "drop_mempool_tx";

pub type ObserverError = Box<dyn error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentifier {
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub block_height: u64,
}

/// What one write did to the canonical chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileEvent {
    /// Blocks canonical after the write and not before, ascending by height
    pub applied_blocks: Vec<BlockIdentifier>,
    /// Blocks canonical before the write and not after, descending by height
    pub rolled_back_blocks: Vec<BlockIdentifier>,
    /// Unconfirmed microblocks that became microblock-canonical on the tip
    pub applied_microblocks: Vec<BlockHeaderHash>,
    /// Unconfirmed microblocks that stopped being microblock-canonical
    pub orphaned_microblocks: Vec<BlockHeaderHash>,
    pub tip: ChainTip,
}

/// One step of a [`ReconcileEvent`], in the order consumers must apply them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockChange<'a> {
    RolledBack(&'a BlockIdentifier),
    Applied(&'a BlockIdentifier),
}

impl ReconcileEvent {
    pub fn empty(tip: ChainTip) -> ReconcileEvent {
        ReconcileEvent {
            applied_blocks: vec![],
            rolled_back_blocks: vec![],
            applied_microblocks: vec![],
            orphaned_microblocks: vec![],
            tip,
        }
    }

    pub fn is_reorg(&self) -> bool {
        !self.rolled_back_blocks.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.applied_blocks.is_empty()
            && self.rolled_back_blocks.is_empty()
            && self.applied_microblocks.is_empty()
            && self.orphaned_microblocks.is_empty()
    }

    /// Rollbacks first (tip downwards), then applications (ancestor upwards).
    pub fn ordered_changes(&self) -> impl Iterator<Item = BlockChange<'_>> {
        self.rolled_back_blocks
            .iter()
            .map(BlockChange::RolledBack)
            .chain(self.applied_blocks.iter().map(BlockChange::Applied))
    }
}

/// A consumer of committed chain changes: cache invalidation, push notification, and the like.
/// Implementations must tolerate seeing the same event twice.
pub trait ChainEventObserver {
    fn on_reconcile(&self, event: &ReconcileEvent) -> Result<(), ObserverError>;

    fn on_mempool_txs_admitted(&self, _txids: &[Txid]) -> Result<(), ObserverError> {
        Ok(())
    }

    fn on_mempool_txs_dropped(
        &self,
        _txids: &[Txid],
        _new_txid: Option<&Txid>,
        _reason: MemPoolDropReason,
    ) -> Result<(), ObserverError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct EventDispatcher {
    registered_observers: Vec<Box<dyn ChainEventObserver>>,
}

impl EventDispatcher {
    pub fn new() -> EventDispatcher {
        EventDispatcher::default()
    }

    pub fn register_observer(&mut self, observer: Box<dyn ChainEventObserver>) {
        self.registered_observers.push(observer);
    }

    /// Deliver one committed ingestion to every observer.  The reconcile event goes first,
    /// then the mempool notifications in the order they were raised.
    pub fn publish(&self, event: &ReconcileEvent, mempool_events: &[MemPoolEvent]) {
        for (i, observer) in self.registered_observers.iter().enumerate() {
            if let Err(e) = observer.on_reconcile(event) {
                warn!("Event observer failed to handle reconcile event";
                      "observer" => i,
                      "tip" => %event.tip.index_block_hash,
                      "error" => %e);
            }
            EventDispatcher::deliver_mempool_events(i, observer.as_ref(), mempool_events);
        }
    }

    /// Deliver mempool notifications from a write that did not touch the chain.
    pub fn publish_mempool_events(&self, mempool_events: &[MemPoolEvent]) {
        if mempool_events.is_empty() {
            return;
        }
        for (i, observer) in self.registered_observers.iter().enumerate() {
            EventDispatcher::deliver_mempool_events(i, observer.as_ref(), mempool_events);
        }
    }

    fn deliver_mempool_events(
        i: usize,
        observer: &dyn ChainEventObserver,
        mempool_events: &[MemPoolEvent],
    ) {
        for mempool_event in mempool_events.iter() {
            let res = match mempool_event {
                MemPoolEvent::Admitted(txids) => observer.on_mempool_txs_admitted(txids),
                MemPoolEvent::Dropped {
                    txids,
                    new_txid,
                    reason,
                } => observer.on_mempool_txs_dropped(txids, new_txid.as_ref(), *reason),
            };
            if let Err(e) = res {
                warn!("Event observer failed to handle mempool event";
                      "observer" => i,
                      "error" => %e);
            }
        }
    }
}

/// Writes every notification as one line of JSON, `{"path": ..., "payload": ...}`.
pub struct JsonEventObserver<W: Write> {
    sink: Mutex<W>,
}

impl<W: Write> JsonEventObserver<W> {
    pub fn new(sink: W) -> JsonEventObserver<W> {
        JsonEventObserver {
            sink: Mutex::new(sink),
        }
    }

    pub fn into_inner(self) -> W {
        match self.sink.into_inner() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn send_payload(&self, path: &str, payload: serde_json::Value) -> Result<(), ObserverError> {
        let line = serde_json::to_string(&json!({ "path": path, "payload": payload }))?;
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| "event observer sink lock poisoned")?;
        writeln!(sink, "{line}")?;
        sink.flush()?;
        Ok(())
    }
}

impl<W: Write> ChainEventObserver for JsonEventObserver<W> {
    fn on_reconcile(&self, event: &ReconcileEvent) -> Result<(), ObserverError> {
        self.send_payload(PATH_RECONCILE, serde_json::to_value(event)?)
    }

    fn on_mempool_txs_admitted(&self, txids: &[Txid]) -> Result<(), ObserverError> {
        let txids: Vec<String> = txids.iter().map(|txid| txid.to_prefixed_hex()).collect();
        self.send_payload(PATH_MEMPOOL_TX_SUBMIT, json!(txids))
    }

    fn on_mempool_txs_dropped(
        &self,
        txids: &[Txid],
        new_txid: Option<&Txid>,
        reason: MemPoolDropReason,
    ) -> Result<(), ObserverError> {
        let dropped_txids: Vec<String> = txids.iter().map(|txid| txid.to_prefixed_hex()).collect();
        let payload = json!({
            "dropped_txids": dropped_txids,
            "reason": reason.to_string(),
            "new_txid": new_txid.map(|txid| txid.to_prefixed_hex()),
        });
        self.send_payload(PATH_MEMPOOL_TX_DROP, payload)
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn make_id(byte: u8, height: u64) -> BlockIdentifier {
        BlockIdentifier {
            index_block_hash: StacksBlockId([byte; 32]),
            block_hash: BlockHeaderHash([byte; 32]),
            block_height: height,
        }
    }

    fn make_tip() -> ChainTip {
        ChainTip {
            block_height: 3,
            index_block_hash: StacksBlockId([0x03; 32]),
            block_hash: BlockHeaderHash([0x03; 32]),
            burn_block_height: 3,
            microblock_hash: None,
            microblock_sequence: None,
            mempool_tx_count: 0,
            mempool_digest: String::new(),
            version: 7,
        }
    }

    struct FailingObserver;

    impl ChainEventObserver for FailingObserver {
        fn on_reconcile(&self, _event: &ReconcileEvent) -> Result<(), ObserverError> {
            Err("unreachable endpoint".into())
        }
    }

    struct RecordingObserver(Rc<RefCell<Vec<String>>>);

    impl ChainEventObserver for RecordingObserver {
        fn on_reconcile(&self, event: &ReconcileEvent) -> Result<(), ObserverError> {
            for change in event.ordered_changes() {
                let entry = match change {
                    BlockChange::RolledBack(id) => format!("rollback {}", id.block_height),
                    BlockChange::Applied(id) => format!("apply {}", id.block_height),
                };
                self.0.borrow_mut().push(entry);
            }
            Ok(())
        }

        fn on_mempool_txs_admitted(&self, txids: &[Txid]) -> Result<(), ObserverError> {
            self.0.borrow_mut().push(format!("admitted {}", txids.len()));
            Ok(())
        }
    }

    #[test]
    fn test_rollbacks_delivered_before_applications() {
        let event = ReconcileEvent {
            applied_blocks: vec![make_id(0xbb, 2), make_id(0x03, 3)],
            rolled_back_blocks: vec![make_id(0x02, 2)],
            applied_microblocks: vec![],
            orphaned_microblocks: vec![],
            tip: make_tip(),
        };
        let log = Rc::new(RefCell::new(vec![]));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_observer(Box::new(FailingObserver));
        dispatcher.register_observer(Box::new(RecordingObserver(log.clone())));
        dispatcher.publish(
            &event,
            &[MemPoolEvent::Admitted(vec![Txid([0x01; 32])])],
        );

        // a failing observer does not stop delivery to the others
        assert_eq!(
            *log.borrow(),
            vec!["rollback 2", "apply 2", "apply 3", "admitted 1"]
        );
        assert!(event.is_reorg());
    }

    #[test]
    fn test_json_observer_writes_lines() {
        let observer = JsonEventObserver::new(vec![]);
        observer.on_reconcile(&ReconcileEvent::empty(make_tip())).unwrap();
        observer
            .on_mempool_txs_dropped(
                &[Txid([0xaa; 32])],
                Some(&Txid([0xbb; 32])),
                MemPoolDropReason::REPLACE_BY_FEE,
            )
            .unwrap();
        let output = String::from_utf8(observer.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["path"], PATH_RECONCILE);
        assert_eq!(lines[0]["payload"]["tip"]["version"], 7);
        assert_eq!(lines[1]["path"], PATH_MEMPOOL_TX_DROP);
        assert_eq!(lines[1]["payload"]["reason"], "ReplaceByFee");
        assert_eq!(
            lines[1]["payload"]["new_txid"],
            Txid([0xbb; 32]).to_prefixed_hex()
        );
    }
}
