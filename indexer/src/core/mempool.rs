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

//! The mempool: transactions the node has seen but no canonical block has confirmed.
//!
//! Mempool rows live next to the chain tables so that every change to the canonical chain
//! and the matching mempool reconciliation commit in one transaction.  Each transaction
//! occupies two nonce slots, its origin's `(sender_address, nonce)` and its payer's
//! `(sponsor_address, sponsor_nonce)` (the origin slot again when not sponsored).  An
//! account's nonce is shared between its origin and sponsor roles, so two transactions
//! conflict when any slot of one equals any slot of the other.  Among non-pruned rows at most
//! one conflicting transaction is pending: the one with the highest fee, then the earliest
//! receipt time, then the lowest txid.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use hashbrown::HashSet;
use indexer_common::types::chainstate::Txid;
use indexer_common::types::StacksAddress;
use indexer_common::util::get_epoch_time_secs;
use rusqlite::{params, Row, ToSql};

use crate::chainstate::db::{ChainStateDB, StacksTransactionInfo};
use crate::chainstate::{TransactionStatus, TransactionType};
use crate::core::MEMPOOL_MAX_PAGE_SIZE;
use crate::monitoring::{
    increment_mempool_gc, increment_mempool_txs_admitted, increment_mempool_txs_dropped,
};
use crate::util_lib::db::{
    opt_u64_to_sql, query_count, query_row, query_rows, u64_to_sql, with_savepoint, DBConn,
    DBTx, Error as db_error, FromColumn, FromRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemPoolDropReason {
    #[serde(rename = "ReplaceAcrossFork")]
    REPLACE_ACROSS_FORK,
    #[serde(rename = "ReplaceByFee")]
    REPLACE_BY_FEE,
    #[serde(rename = "StaleGarbageCollect")]
    STALE_COLLECT,
    #[serde(rename = "TooExpensive")]
    TOO_EXPENSIVE,
    #[serde(rename = "Problematic")]
    PROBLEMATIC,
    #[serde(rename = "ApiGarbageCollect")]
    API_GARBAGE_COLLECT,
}

impl fmt::Display for MemPoolDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemPoolDropReason::STALE_COLLECT => write!(f, "StaleGarbageCollect"),
            MemPoolDropReason::TOO_EXPENSIVE => write!(f, "TooExpensive"),
            MemPoolDropReason::REPLACE_ACROSS_FORK => write!(f, "ReplaceAcrossFork"),
            MemPoolDropReason::REPLACE_BY_FEE => write!(f, "ReplaceByFee"),
            MemPoolDropReason::PROBLEMATIC => write!(f, "Problematic"),
            MemPoolDropReason::API_GARBAGE_COLLECT => write!(f, "ApiGarbageCollect"),
        }
    }
}

impl FromStr for MemPoolDropReason {
    type Err = String;

    fn from_str(s: &str) -> Result<MemPoolDropReason, String> {
        match s {
            "StaleGarbageCollect" => Ok(MemPoolDropReason::STALE_COLLECT),
            "TooExpensive" => Ok(MemPoolDropReason::TOO_EXPENSIVE),
            "ReplaceAcrossFork" => Ok(MemPoolDropReason::REPLACE_ACROSS_FORK),
            "ReplaceByFee" => Ok(MemPoolDropReason::REPLACE_BY_FEE),
            "Problematic" => Ok(MemPoolDropReason::PROBLEMATIC),
            "ApiGarbageCollect" => Ok(MemPoolDropReason::API_GARBAGE_COLLECT),
            _ => Err(format!("Unknown mempool drop reason '{s}'")),
        }
    }
}

impl MemPoolDropReason {
    /// Status a dropped mempool row carries
    pub fn to_status(&self) -> TransactionStatus {
        match self {
            MemPoolDropReason::REPLACE_ACROSS_FORK => TransactionStatus::DroppedReplaceAcrossFork,
            MemPoolDropReason::REPLACE_BY_FEE => TransactionStatus::DroppedReplaceByFee,
            MemPoolDropReason::STALE_COLLECT => TransactionStatus::DroppedStaleGarbageCollect,
            MemPoolDropReason::TOO_EXPENSIVE => TransactionStatus::DroppedTooExpensive,
            MemPoolDropReason::PROBLEMATIC => TransactionStatus::DroppedProblematic,
            MemPoolDropReason::API_GARBAGE_COLLECT => TransactionStatus::DroppedApiGarbageCollect,
        }
    }
}

/// Receives mempool membership changes.  Implementations should be cheap; the coordinator
/// calls them only after the change has committed.
pub trait MemPoolEventDispatcher {
    fn mempool_txs_admitted(&self, txids: Vec<Txid>);
    fn mempool_txs_dropped(
        &self,
        txids: Vec<Txid>,
        new_txid: Option<Txid>,
        reason: MemPoolDropReason,
    );
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MemPoolEvent {
    Admitted(Vec<Txid>),
    Dropped {
        txids: Vec<Txid>,
        new_txid: Option<Txid>,
        reason: MemPoolDropReason,
    },
}

/// Collects mempool notifications raised inside a store transaction so they can be
/// published once it commits, and discarded if it does not.
#[derive(Debug, Default)]
pub struct MemPoolEventBuffer {
    events: RefCell<Vec<MemPoolEvent>>,
}

impl MemPoolEventBuffer {
    pub fn new() -> MemPoolEventBuffer {
        MemPoolEventBuffer::default()
    }

    pub fn take(&self) -> Vec<MemPoolEvent> {
        self.events.take()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl MemPoolEventDispatcher for MemPoolEventBuffer {
    fn mempool_txs_admitted(&self, txids: Vec<Txid>) {
        self.events.borrow_mut().push(MemPoolEvent::Admitted(txids));
    }

    fn mempool_txs_dropped(
        &self,
        txids: Vec<Txid>,
        new_txid: Option<Txid>,
        reason: MemPoolDropReason,
    ) {
        self.events.borrow_mut().push(MemPoolEvent::Dropped {
            txids,
            new_txid,
            reason,
        });
    }
}

/// A transaction as received from the node's mempool feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolTxData {
    pub tx_id: Txid,
    pub tx_type: TransactionType,
    pub raw_tx: String,
    pub sender_address: StacksAddress,
    pub nonce: u64,
    #[serde(default)]
    pub sponsor_address: Option<StacksAddress>,
    #[serde(default)]
    pub sponsor_nonce: Option<u64>,
    pub fee_rate: u64,
    /// Seconds since the epoch; defaults to arrival time
    #[serde(default)]
    pub receipt_time: Option<u64>,
    #[serde(default)]
    pub token_transfer_recipient: Option<String>,
    #[serde(default)]
    pub contract_id: Option<String>,
}

impl MempoolTxData {
    fn from_chain_tx(info: &StacksTransactionInfo, receipt_time: u64) -> MempoolTxData {
        MempoolTxData {
            tx_id: info.tx_id,
            tx_type: info.tx_type,
            raw_tx: info.raw_tx.clone(),
            sender_address: info.sender_address.clone(),
            nonce: info.nonce,
            sponsor_address: info.sponsor_address.clone(),
            sponsor_nonce: info.sponsor_nonce,
            fee_rate: info.fee_rate,
            receipt_time: Some(receipt_time),
            token_transfer_recipient: info.token_transfer_recipient.clone(),
            contract_id: info.contract_id.clone(),
        }
    }

    fn payer(&self) -> (&StacksAddress, u64) {
        match (&self.sponsor_address, self.sponsor_nonce) {
            (Some(addr), Some(nonce)) => (addr, nonce),
            _ => (&self.sender_address, self.nonce),
        }
    }
}

/// The two nonce slots a transaction occupies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceSlots {
    pub origin: (StacksAddress, u64),
    pub payer: (StacksAddress, u64),
}

impl NonceSlots {
    pub fn new(origin: (&StacksAddress, u64), payer: (&StacksAddress, u64)) -> NonceSlots {
        NonceSlots {
            origin: (origin.0.clone(), origin.1),
            payer: (payer.0.clone(), payer.1),
        }
    }

    pub fn conflicts_with(&self, other: &NonceSlots) -> bool {
        let theirs = [&other.origin, &other.payer];
        [&self.origin, &self.payer]
            .iter()
            .any(|slot| theirs.contains(slot))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemPoolTxInfo {
    pub tx_id: Txid,
    pub tx_type: TransactionType,
    pub raw_tx: String,
    pub sender_address: StacksAddress,
    pub nonce: u64,
    pub sponsor_address: Option<StacksAddress>,
    pub sponsor_nonce: Option<u64>,
    pub fee_rate: u64,
    pub receipt_time: u64,
    pub receipt_block_height: u64,
    pub token_transfer_recipient: Option<String>,
    pub contract_id: Option<String>,
    pub pruned: bool,
    pub status: TransactionStatus,
    pub replaced_by_tx_id: Option<Txid>,
}

impl MemPoolTxInfo {
    pub fn slots(&self) -> NonceSlots {
        let payer = match (&self.sponsor_address, self.sponsor_nonce) {
            (Some(addr), Some(nonce)) => (addr, nonce),
            _ => (&self.sender_address, self.nonce),
        };
        NonceSlots::new((&self.sender_address, self.nonce), payer)
    }

    /// Fee-contest order: highest fee, then earliest receipt, then lowest txid.
    fn rank(&self, other: &MemPoolTxInfo) -> Ordering {
        other
            .fee_rate
            .cmp(&self.fee_rate)
            .then(self.receipt_time.cmp(&other.receipt_time))
            .then(self.tx_id.cmp(&other.tx_id))
    }
}

impl FromRow<MemPoolTxInfo> for MemPoolTxInfo {
    fn from_row(row: &Row) -> Result<MemPoolTxInfo, db_error> {
        Ok(MemPoolTxInfo {
            tx_id: Txid::from_column(row, "tx_id")?,
            tx_type: row.get("tx_type")?,
            raw_tx: row.get("raw_tx")?,
            sender_address: StacksAddress::from_column(row, "sender_address")?,
            nonce: u64::from_column(row, "nonce")?,
            sponsor_address: StacksAddress::from_column(row, "sponsor_address")?,
            sponsor_nonce: u64::from_column(row, "sponsor_nonce")?,
            fee_rate: u64::from_column(row, "fee_rate")?,
            receipt_time: u64::from_column(row, "receipt_time")?,
            receipt_block_height: u64::from_column(row, "receipt_block_height")?,
            token_transfer_recipient: row.get("token_transfer_recipient")?,
            contract_id: row.get("contract_id")?,
            pruned: row.get("pruned")?,
            status: row.get("status")?,
            replaced_by_tx_id: Txid::from_column(row, "replaced_by_tx_id")?,
        })
    }
}

/// Which pending transactions to list.  Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MempoolFilter {
    #[serde(default)]
    pub sender_address: Option<StacksAddress>,
    #[serde(default)]
    pub recipient_address: Option<String>,
    /// Matches the sender, the sponsor, or the token-transfer recipient
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub tx_types: Vec<TransactionType>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MempoolTxPage {
    pub limit: u32,
    pub offset: u32,
    pub total: u64,
    pub results: Vec<MemPoolTxInfo>,
}

const MEMPOOL_INITIAL_SCHEMA: &[&str] = &[r#"
    CREATE TABLE mempool_txs(
        tx_id TEXT NOT NULL,
        tx_type TEXT NOT NULL,
        raw_tx TEXT NOT NULL,
        sender_address TEXT NOT NULL,
        nonce INTEGER NOT NULL,
        sponsor_address TEXT,
        sponsor_nonce INTEGER,
        -- sponsor if sponsored, else sender
        payer_address TEXT NOT NULL,
        payer_nonce INTEGER NOT NULL,
        fee_rate INTEGER NOT NULL,
        receipt_time INTEGER NOT NULL,
        receipt_block_height INTEGER NOT NULL,
        token_transfer_recipient TEXT,
        contract_id TEXT,
        pruned INTEGER NOT NULL,
        status TEXT NOT NULL,
        replaced_by_tx_id TEXT,
        PRIMARY KEY(tx_id)
    );
    "#];

const MEMPOOL_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS mempool_by_origin ON mempool_txs(sender_address, nonce);",
    "CREATE INDEX IF NOT EXISTS mempool_by_payer ON mempool_txs(payer_address, payer_nonce);",
    "CREATE INDEX IF NOT EXISTS mempool_by_sponsor ON mempool_txs(sponsor_address, sponsor_nonce);",
    "CREATE INDEX IF NOT EXISTS mempool_by_recipient ON mempool_txs(token_transfer_recipient);",
    "CREATE INDEX IF NOT EXISTS mempool_by_replacement ON mempool_txs(replaced_by_tx_id);",
    "CREATE INDEX IF NOT EXISTS mempool_by_pruned_height ON mempool_txs(pruned, receipt_block_height);",
    "CREATE INDEX IF NOT EXISTS mempool_by_receipt_time ON mempool_txs(pruned, receipt_time DESC);",
];

/// Rows in either of two slots: `?1`/`?2` and `?3`/`?4`.
const SLOT_CONFLICT_CLAUSE: &str = "((sender_address = ?1 AND nonce = ?2)
     OR (payer_address = ?1 AND payer_nonce = ?2)
     OR (sender_address = ?3 AND nonce = ?4)
     OR (payer_address = ?3 AND payer_nonce = ?4))";

/// A transaction that lost a fee contest: (loser, winner)
type Replacement = (Txid, Txid);

#[derive(Debug, Default)]
struct ContestOutcome {
    /// Losers that were not already dropped in favor of the same winner
    replaced: Vec<Replacement>,
    /// Winners that were pruned or dropped before the contest
    reinstated: Vec<Txid>,
}

enum Revival {
    Contested(ContestOutcome),
    /// A canonical transaction on the new fork already spends its nonce
    ReplacedAcrossFork(Txid),
}

/// Operations on the mempool tables.  They run on the chainstate database's connection (or an
/// open transaction on it), so that they commit together with the chain changes they follow.
pub struct MemPoolDB;

impl MemPoolDB {
    #[cfg_attr(test, mutants::skip)]
    pub fn instantiate_mempool_schema(tx: &DBTx) -> Result<(), db_error> {
        for cmd in MEMPOOL_INITIAL_SCHEMA {
            tx.execute_batch(cmd)?;
        }
        Ok(())
    }

    #[cfg_attr(test, mutants::skip)]
    pub fn add_indexes(tx: &mut DBTx) -> Result<(), db_error> {
        for cmd in MEMPOOL_INDEXES {
            tx.execute_batch(cmd)?;
        }
        Ok(())
    }

    pub fn db_has_tx(conn: &DBConn, txid: &Txid) -> Result<bool, db_error> {
        query_row(conn, "SELECT 1 FROM mempool_txs WHERE tx_id = ?1", params![txid])
            .map(|row_opt: Option<i64>| row_opt.is_some())
    }

    pub fn get_tx(conn: &DBConn, txid: &Txid) -> Result<Option<MemPoolTxInfo>, db_error> {
        query_row(conn, "SELECT * FROM mempool_txs WHERE tx_id = ?1", params![txid])
    }

    pub fn get_pending_count(conn: &DBConn) -> Result<u64, db_error> {
        query_count(conn, "SELECT COUNT(*) FROM mempool_txs WHERE pruned = 0", [])
    }

    /// Mempool rows, other than `exclude`, in any of `slots`, narrowed by `condition`.
    fn get_slot_rows(
        conn: &DBConn,
        slots: &NonceSlots,
        exclude: &Txid,
        condition: &str,
    ) -> Result<Vec<MemPoolTxInfo>, db_error> {
        let sql = format!(
            "SELECT * FROM mempool_txs WHERE {SLOT_CONFLICT_CLAUSE} AND tx_id != ?5 AND {condition}"
        );
        let args: &[&dyn ToSql] = &[
            &slots.origin.0,
            &u64_to_sql(slots.origin.1)?,
            &slots.payer.0,
            &u64_to_sql(slots.payer.1)?,
            exclude,
        ];
        query_rows(conn, &sql, args)
    }

    fn insert_tx(
        conn: &DBConn,
        data: &MempoolTxData,
        receipt_time: u64,
        receipt_block_height: u64,
        pruned: bool,
    ) -> Result<(), db_error> {
        let (payer_address, payer_nonce) = data.payer();
        let args: &[&dyn ToSql] = &[
            &data.tx_id,
            &data.tx_type,
            &data.raw_tx,
            &data.sender_address,
            &u64_to_sql(data.nonce)?,
            &data.sponsor_address,
            &opt_u64_to_sql(data.sponsor_nonce)?,
            payer_address,
            &u64_to_sql(payer_nonce)?,
            &u64_to_sql(data.fee_rate)?,
            &u64_to_sql(receipt_time)?,
            &u64_to_sql(receipt_block_height)?,
            &data.token_transfer_recipient,
            &data.contract_id,
            &pruned,
            &TransactionStatus::Pending,
        ];
        conn.execute(
            "INSERT INTO mempool_txs
                (tx_id, tx_type, raw_tx, sender_address, nonce, sponsor_address, sponsor_nonce,
                 payer_address, payer_nonce, fee_rate, receipt_time, receipt_block_height,
                 token_transfer_recipient, contract_id, pruned, status, replaced_by_tx_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, NULL)",
            args,
        )?;
        Ok(())
    }

    fn set_pending(conn: &DBConn, txid: &Txid) -> Result<(), db_error> {
        conn.execute(
            "UPDATE mempool_txs SET pruned = 0, status = ?2, replaced_by_tx_id = NULL WHERE tx_id = ?1",
            params![txid, TransactionStatus::Pending],
        )?;
        Ok(())
    }

    fn set_dropped(
        conn: &DBConn,
        txid: &Txid,
        reason: MemPoolDropReason,
        new_txid: Option<&Txid>,
    ) -> Result<bool, db_error> {
        let updated = conn.execute(
            "UPDATE mempool_txs SET pruned = 1, status = ?2, replaced_by_tx_id = ?3 WHERE tx_id = ?1",
            params![txid, reason.to_status(), new_txid],
        )?;
        Ok(updated > 0)
    }

    /// Settle the fee contest among `candidates`.  Candidates are visited best first: each one
    /// stays (or becomes) pending unless it conflicts with a candidate already kept, or with a
    /// pending row outside the contest, in which case it is dropped in favor of that one.
    fn run_fee_contest(
        conn: &DBConn,
        mut candidates: Vec<MemPoolTxInfo>,
    ) -> Result<ContestOutcome, db_error> {
        candidates.sort_by(|a, b| a.rank(b));
        candidates.dedup_by(|a, b| a.tx_id == b.tx_id);
        let contestants: HashSet<Txid> = candidates.iter().map(|c| c.tx_id).collect();

        let mut kept: Vec<(Txid, NonceSlots)> = vec![];
        let mut outcome = ContestOutcome::default();
        for candidate in candidates.into_iter() {
            let slots = candidate.slots();
            let winner = match kept.iter().find(|(_, kept_slots)| kept_slots.conflicts_with(&slots)) {
                Some((txid, _)) => Some(*txid),
                None => MemPoolDB::get_slot_rows(conn, &slots, &candidate.tx_id, "pruned = 0")?
                    .into_iter()
                    .find(|occupant| !contestants.contains(&occupant.tx_id))
                    .map(|occupant| occupant.tx_id),
            };
            match winner {
                Some(winner) => {
                    let already = candidate.pruned
                        && candidate.status == TransactionStatus::DroppedReplaceByFee
                        && candidate.replaced_by_tx_id == Some(winner);
                    if !already {
                        MemPoolDB::set_dropped(
                            conn,
                            &candidate.tx_id,
                            MemPoolDropReason::REPLACE_BY_FEE,
                            Some(&winner),
                        )?;
                        outcome.replaced.push((candidate.tx_id, winner));
                    }
                }
                None => {
                    if candidate.pruned || candidate.status != TransactionStatus::Pending {
                        MemPoolDB::set_pending(conn, &candidate.tx_id)?;
                        outcome.reinstated.push(candidate.tx_id);
                    }
                    kept.push((candidate.tx_id, slots));
                }
            }
        }
        Ok(outcome)
    }

    /// Contest between a freshly inserted transaction and the pending rows in its slots.
    fn resolve_new_tx(conn: &DBConn, txid: &Txid) -> Result<Vec<Replacement>, db_error> {
        let row = MemPoolDB::get_tx(conn, txid)?.ok_or(db_error::NotFoundError)?;
        let mut candidates = MemPoolDB::get_slot_rows(conn, &row.slots(), txid, "pruned = 0")?;
        candidates.push(row);
        Ok(MemPoolDB::run_fee_contest(conn, candidates)?.replaced)
    }

    fn announce_replacements(
        replaced: &[Replacement],
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) {
        if replaced.is_empty() {
            return;
        }
        increment_mempool_txs_dropped(replaced.len() as u64);
        if let Some(event_observer) = event_observer {
            for (loser, winner) in replaced.iter() {
                event_observer.mempool_txs_dropped(
                    vec![*loser],
                    Some(*winner),
                    MemPoolDropReason::REPLACE_BY_FEE,
                );
            }
        }
    }

    /// Add transactions received from the node.  Transactions already stored are ignored, and
    /// transactions already confirmed on the canonical chain are stored pruned.  A failure
    /// storing one transaction is logged and rolled back without affecting the others.
    /// Returns the txids that entered the mempool.
    pub fn submit(
        tx: &DBTx,
        txs: &[MempoolTxData],
        chain_height: u64,
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) -> Result<Vec<Txid>, db_error> {
        let now = get_epoch_time_secs();
        let mut admitted = vec![];
        let mut replaced = vec![];
        for data in txs.iter() {
            if MemPoolDB::db_has_tx(tx, &data.tx_id)? {
                test_debug!("Mempool tx already stored"; "txid" => %data.tx_id);
                continue;
            }
            let confirmed = ChainStateDB::is_tx_chain_visible(tx, &data.tx_id)?;
            let receipt_time = data.receipt_time.unwrap_or(now);
            let outcome = with_savepoint(tx, "mempool_submit", |conn| {
                MemPoolDB::insert_tx(conn, data, receipt_time, chain_height, confirmed)?;
                if confirmed {
                    return Ok(vec![]);
                }
                MemPoolDB::resolve_new_tx(conn, &data.tx_id)
            });
            match outcome {
                Ok(mut pair_replaced) => {
                    if !confirmed {
                        admitted.push(data.tx_id);
                    }
                    replaced.append(&mut pair_replaced);
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Failed to store mempool transaction"; "txid" => %data.tx_id, "error" => %e);
                }
            }
        }

        if !admitted.is_empty() {
            debug!("Admitted mempool transactions"; "count" => admitted.len());
            increment_mempool_txs_admitted(admitted.len() as u64);
            if let Some(event_observer) = event_observer {
                event_observer.mempool_txs_admitted(admitted.clone());
            }
        }
        MemPoolDB::announce_replacements(&replaced, event_observer);
        Ok(admitted)
    }

    fn confirm_one(
        conn: &DBConn,
        txid: &Txid,
        slots: &NonceSlots,
    ) -> Result<Vec<Replacement>, db_error> {
        // a transaction that was dropped by fee and then mined anyway is no longer dropped
        conn.execute(
            "UPDATE mempool_txs SET pruned = 1,
                replaced_by_tx_id = CASE WHEN status = ?2 THEN NULL ELSE replaced_by_tx_id END,
                status = CASE WHEN status = ?2 THEN ?3 ELSE status END
             WHERE tx_id = ?1",
            params![
                txid,
                TransactionStatus::DroppedReplaceByFee,
                TransactionStatus::Pending
            ],
        )?;

        let superseded = MemPoolDB::get_slot_rows(
            conn,
            slots,
            txid,
            "(pruned = 0 OR status = 'dropped_replace_by_fee')",
        )?;
        let mut replaced = vec![];
        for row in superseded.into_iter() {
            MemPoolDB::set_dropped(
                conn,
                &row.tx_id,
                MemPoolDropReason::REPLACE_BY_FEE,
                Some(txid),
            )?;
            if !row.pruned {
                replaced.push((row.tx_id, *txid));
            }
        }
        Ok(replaced)
    }

    /// Transactions became visible on the canonical chain: prune them, and drop every other
    /// transaction competing for their nonces in favor of them.
    pub fn confirm(
        tx: &DBTx,
        txids: &[Txid],
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) -> Result<(), db_error> {
        let mut replaced = vec![];
        for txid in txids.iter() {
            let slots = match ChainStateDB::get_visible_tx(tx, txid, true)? {
                Some(info) => NonceSlots::new((&info.sender_address, info.nonce), info.payer()),
                None => match MemPoolDB::get_tx(tx, txid)? {
                    Some(row) => row.slots(),
                    None => continue,
                },
            };
            match with_savepoint(tx, "mempool_confirm", |conn| {
                MemPoolDB::confirm_one(conn, txid, &slots)
            }) {
                Ok(mut pair_replaced) => replaced.append(&mut pair_replaced),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Failed to prune confirmed mempool transaction"; "txid" => %txid, "error" => %e);
                }
            }
        }
        MemPoolDB::announce_replacements(&replaced, event_observer);
        Ok(())
    }

    fn revive_one(
        conn: &DBConn,
        chain_tx: &StacksTransactionInfo,
        receipt_time: u64,
        chain_height: u64,
    ) -> Result<Revival, db_error> {
        let txid = chain_tx.tx_id;
        if MemPoolDB::db_has_tx(conn, &txid)? {
            MemPoolDB::set_pending(conn, &txid)?;
        } else {
            let data = MempoolTxData::from_chain_tx(chain_tx, receipt_time);
            MemPoolDB::insert_tx(conn, &data, receipt_time, chain_height, false)?;
        }
        let row = MemPoolDB::get_tx(conn, &txid)?.ok_or(db_error::NotFoundError)?;
        let slots = row.slots();

        if let Some(on_chain) = ChainStateDB::get_visible_conflicting_tx(
            conn,
            &txid,
            &slots.origin.0,
            slots.origin.1,
            &slots.payer.0,
            slots.payer.1,
        )? {
            MemPoolDB::set_dropped(
                conn,
                &txid,
                MemPoolDropReason::REPLACE_ACROSS_FORK,
                Some(&on_chain),
            )?;
            return Ok(Revival::ReplacedAcrossFork(on_chain));
        }

        let mut candidates: Vec<MemPoolTxInfo> = query_rows(
            conn,
            "SELECT * FROM mempool_txs WHERE replaced_by_tx_id = ?1 AND status = ?2",
            params![txid, TransactionStatus::DroppedReplaceByFee],
        )?;
        candidates.append(&mut MemPoolDB::get_slot_rows(
            conn,
            &slots,
            &txid,
            "pruned = 0",
        )?);
        let mut contest = vec![row];
        for candidate in candidates.into_iter() {
            if !ChainStateDB::is_tx_chain_visible(conn, &candidate.tx_id)? {
                contest.push(candidate);
            }
        }

        let mut outcome = MemPoolDB::run_fee_contest(conn, contest)?;
        // the orphan was made pending before the contest, so the contest cannot report it
        if !outcome.replaced.iter().any(|(loser, _)| *loser == txid) {
            outcome.reinstated.insert(0, txid);
        }
        Ok(Revival::Contested(outcome))
    }

    /// The canonical chain moved: `orphaned` transactions were visible before and are not now,
    /// `newly_confirmed` ones are visible now and were not before.  Orphaned transactions go
    /// back into the mempool and contest their nonces again; then the newly confirmed ones are
    /// pruned as by [`MemPoolDB::confirm`].
    pub fn reconcile_on_reorg(
        tx: &DBTx,
        orphaned: &[Txid],
        newly_confirmed: &[Txid],
        chain_height: u64,
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) -> Result<(), db_error> {
        let reconfirmed: HashSet<&Txid> = newly_confirmed.iter().collect();
        let now = get_epoch_time_secs();
        let mut revived = vec![];
        let mut replaced = vec![];
        let mut across_fork = vec![];

        for txid in orphaned.iter() {
            if reconfirmed.contains(txid) || ChainStateDB::is_tx_chain_visible(tx, txid)? {
                continue;
            }
            let Some(chain_tx) = ChainStateDB::get_latest_tx_row(tx, txid)? else {
                continue;
            };
            if matches!(
                chain_tx.tx_type,
                TransactionType::Coinbase | TransactionType::TenureChange
            ) {
                // only meaningful in the block that carried it
                continue;
            }
            match with_savepoint(tx, "mempool_revive", |conn| {
                MemPoolDB::revive_one(conn, &chain_tx, now, chain_height)
            }) {
                Ok(Revival::Contested(mut outcome)) => {
                    revived.append(&mut outcome.reinstated);
                    replaced.append(&mut outcome.replaced);
                }
                Ok(Revival::ReplacedAcrossFork(on_chain)) => across_fork.push((*txid, on_chain)),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!("Failed to revive orphaned transaction"; "txid" => %txid, "error" => %e);
                }
            }
        }

        let mut seen = HashSet::new();
        revived.retain(|txid| seen.insert(*txid));
        // a transaction reinstated by one revival may lose to a later one
        let mut still_pending = vec![];
        for txid in revived.into_iter() {
            if MemPoolDB::get_tx(tx, &txid)?.map_or(false, |row| !row.pruned) {
                still_pending.push(txid);
            }
        }
        let revived = still_pending;
        if !revived.is_empty() {
            info!("Revived orphaned transactions into the mempool"; "count" => revived.len());
            increment_mempool_txs_admitted(revived.len() as u64);
            if let Some(event_observer) = event_observer {
                event_observer.mempool_txs_admitted(revived);
            }
        }
        MemPoolDB::announce_replacements(&replaced, event_observer);
        if !across_fork.is_empty() {
            increment_mempool_txs_dropped(across_fork.len() as u64);
        }
        if let Some(event_observer) = event_observer {
            for (txid, on_chain) in across_fork.into_iter() {
                event_observer.mempool_txs_dropped(
                    vec![txid],
                    Some(on_chain),
                    MemPoolDropReason::REPLACE_ACROSS_FORK,
                );
            }
        }

        MemPoolDB::confirm(tx, newly_confirmed, event_observer)
    }

    /// Explicitly drop transactions.  Dropping an already-dropped transaction again just
    /// overwrites its status.  Returns the txids that were in the mempool.
    pub fn drop_txs(
        tx: &DBTx,
        txids: &[Txid],
        reason: MemPoolDropReason,
        new_txid: Option<&Txid>,
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) -> Result<Vec<Txid>, db_error> {
        let mut dropped = vec![];
        for txid in txids.iter() {
            if MemPoolDB::set_dropped(tx, txid, reason, new_txid)? {
                dropped.push(*txid);
            }
        }
        if !dropped.is_empty() {
            debug!("Dropped mempool transactions"; "count" => dropped.len(), "reason" => %reason);
            increment_mempool_txs_dropped(dropped.len() as u64);
            if let Some(event_observer) = event_observer {
                event_observer.mempool_txs_dropped(dropped.clone(), new_txid.copied(), reason);
            }
        }
        Ok(dropped)
    }

    /// Garbage-collect the mempool.  If `stale_threshold` is set, pending transactions
    /// received more than that many blocks ago are dropped first.  Then pruned transactions
    /// received more than `threshold` blocks ago are deleted.  Pending transactions are never
    /// deleted.  Returns how many rows were deleted.
    pub fn garbage_collect(
        tx: &DBTx,
        chain_height: u64,
        threshold: u64,
        stale_threshold: Option<u64>,
        event_observer: Option<&dyn MemPoolEventDispatcher>,
    ) -> Result<u64, db_error> {
        if let Some(min_height) = stale_threshold.and_then(|stale| chain_height.checked_sub(stale))
        {
            let sql = "SELECT tx_id FROM mempool_txs WHERE pruned = 0 AND receipt_block_height < ?1";
            let stale: Vec<Txid> = query_rows(tx, sql, params![u64_to_sql(min_height)?])?;
            if !stale.is_empty() {
                MemPoolDB::drop_txs(
                    tx,
                    &stale,
                    MemPoolDropReason::API_GARBAGE_COLLECT,
                    None,
                    event_observer,
                )?;
            }
        }

        let Some(min_height) = chain_height.checked_sub(threshold) else {
            return Ok(0);
        };
        let deleted = tx.execute(
            "DELETE FROM mempool_txs WHERE pruned = 1 AND receipt_block_height < ?1",
            params![u64_to_sql(min_height)?],
        )?;
        if deleted > 0 {
            debug!("Garbage-collected mempool"; "deleted" => deleted, "min_height" => min_height);
        }
        increment_mempool_gc();
        Ok(deleted as u64)
    }

    /// One page of pending transactions, newest first.
    pub fn get_mempool_tx_list(
        conn: &DBConn,
        filter: &MempoolFilter,
        limit: u32,
        offset: u32,
    ) -> Result<MempoolTxPage, db_error> {
        let limit = limit.min(MEMPOOL_MAX_PAGE_SIZE);
        let limit_arg = i64::from(limit);
        let offset_arg = i64::from(offset);
        let type_names: Vec<&'static str> =
            filter.tx_types.iter().map(|t| t.get_name_str()).collect();

        let mut clauses = vec!["pruned = 0".to_string()];
        let mut args: Vec<&dyn ToSql> = vec![];
        if let Some(sender) = &filter.sender_address {
            args.push(sender);
            clauses.push(format!("sender_address = ?{}", args.len()));
        }
        if let Some(recipient) = &filter.recipient_address {
            args.push(recipient);
            clauses.push(format!("token_transfer_recipient = ?{}", args.len()));
        }
        if let Some(address) = &filter.address {
            args.push(address);
            let n = args.len();
            clauses.push(format!(
                "(sender_address = ?{n} OR sponsor_address = ?{n} OR token_transfer_recipient = ?{n})"
            ));
        }
        if !type_names.is_empty() {
            let mut placeholders = vec![];
            for name in type_names.iter() {
                args.push(name);
                placeholders.push(format!("?{}", args.len()));
            }
            clauses.push(format!("tx_type IN ({})", placeholders.join(", ")));
        }
        let where_clause = clauses.join(" AND ");

        let total = query_count(
            conn,
            &format!("SELECT COUNT(*) FROM mempool_txs WHERE {where_clause}"),
            args.as_slice(),
        )?;

        args.push(&limit_arg);
        let limit_idx = args.len();
        args.push(&offset_arg);
        let offset_idx = args.len();
        let sql = format!(
            "SELECT * FROM mempool_txs WHERE {where_clause}
             ORDER BY receipt_time DESC, tx_id ASC
             LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
        );
        let results = query_rows(conn, &sql, args.as_slice())?;
        Ok(MempoolTxPage {
            limit,
            offset,
            total,
            results,
        })
    }

    /// Every nonce `address` uses in a pending transaction, ascending.
    pub fn get_pending_nonces(conn: &DBConn, address: &StacksAddress) -> Result<Vec<u64>, db_error> {
        let sql = "SELECT n FROM (
                       SELECT nonce AS n FROM mempool_txs WHERE pruned = 0 AND sender_address = ?1
                       UNION
                       SELECT sponsor_nonce AS n FROM mempool_txs
                       WHERE pruned = 0 AND sponsor_address = ?1 AND sponsor_nonce IS NOT NULL
                   )
                   ORDER BY n ASC";
        query_rows(conn, sql, params![address])
    }
}
