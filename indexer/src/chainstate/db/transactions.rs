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

use hashbrown::HashSet;
use indexer_common::consts::{MICROBLOCK_SEQUENCE_NONE, UNCONFIRMED_INDEX_BLOCK_HASH};
use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId, Txid};
use indexer_common::types::StacksAddress;
use rusqlite::{params, Row, ToSql};

use crate::chainstate::db::ChainStateDB;
use crate::chainstate::{BlockData, EventData, TransactionData, TransactionStatus, TransactionType};
use crate::util_lib::db::{
    opt_u64_to_sql, query_row, query_rows, u64_to_sql, DBConn, DBTx, Error as db_error, FromColumn, FromRow,
};

/// Bound parameters per visibility query, under sqlite's default variable limit.
const TXID_QUERY_CHUNK: usize = 500;

/// Where a transaction row sits: which block (or unconfirmed stream) and which microblock.
#[derive(Debug, Clone, PartialEq)]
pub struct TxPlacement {
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub parent_index_block_hash: StacksBlockId,
    pub block_height: u64,
    pub burn_block_time: u64,
    pub microblock_hash: BlockHeaderHash,
    pub microblock_sequence: u32,
    pub canonical: bool,
    pub microblock_canonical: bool,
}

impl TxPlacement {
    /// Mined directly in `block`.
    pub fn anchored(block: &BlockData) -> TxPlacement {
        TxPlacement {
            index_block_hash: block.index_block_hash,
            block_hash: block.block_hash,
            parent_index_block_hash: block.parent_index_block_hash,
            block_height: block.block_height,
            burn_block_time: block.burn_block_time,
            microblock_hash: BlockHeaderHash::sentinel(),
            microblock_sequence: MICROBLOCK_SEQUENCE_NONE,
            canonical: false,
            microblock_canonical: true,
        }
    }

    /// Streamed in a microblock of `block`'s parent and confirmed by `block`.
    pub fn confirmed_stream(
        block: &BlockData,
        microblock_hash: &BlockHeaderHash,
        microblock_sequence: u32,
    ) -> TxPlacement {
        TxPlacement {
            microblock_hash: *microblock_hash,
            microblock_sequence,
            ..TxPlacement::anchored(block)
        }
    }

    /// Streamed on top of `anchor`, not yet confirmed by any block.
    pub fn unconfirmed_stream(
        anchor: &BlockData,
        anchor_canonical: bool,
        microblock_hash: &BlockHeaderHash,
        microblock_sequence: u32,
        microblock_canonical: bool,
    ) -> TxPlacement {
        TxPlacement {
            index_block_hash: UNCONFIRMED_INDEX_BLOCK_HASH,
            block_hash: BlockHeaderHash::sentinel(),
            parent_index_block_hash: anchor.index_block_hash,
            block_height: anchor.block_height + 1,
            burn_block_time: anchor.burn_block_time,
            microblock_hash: *microblock_hash,
            microblock_sequence,
            canonical: anchor_canonical,
            microblock_canonical,
        }
    }
}

/// A transaction row from the chain tables.
#[derive(Debug, Clone, PartialEq)]
pub struct StacksTransactionInfo {
    pub tx_id: Txid,
    pub tx_index: u32,
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub block_height: u64,
    pub burn_block_time: u64,
    pub microblock_hash: BlockHeaderHash,
    pub microblock_sequence: u32,
    pub tx_type: TransactionType,
    pub raw_tx: String,
    pub sender_address: StacksAddress,
    pub nonce: u64,
    pub sponsor_address: Option<StacksAddress>,
    pub sponsor_nonce: Option<u64>,
    pub fee_rate: u64,
    pub status: TransactionStatus,
    pub token_transfer_recipient: Option<String>,
    pub contract_id: Option<String>,
    pub canonical: bool,
    pub microblock_canonical: bool,
}

impl StacksTransactionInfo {
    /// Streamed, and not yet confirmed by an anchor block
    pub fn is_unanchored(&self) -> bool {
        self.index_block_hash.is_zero()
    }

    pub fn payer(&self) -> (&StacksAddress, u64) {
        match (&self.sponsor_address, self.sponsor_nonce) {
            (Some(addr), Some(nonce)) => (addr, nonce),
            _ => (&self.sender_address, self.nonce),
        }
    }
}

impl FromRow<StacksTransactionInfo> for StacksTransactionInfo {
    fn from_row(row: &Row) -> Result<StacksTransactionInfo, db_error> {
        Ok(StacksTransactionInfo {
            tx_id: Txid::from_column(row, "tx_id")?,
            tx_index: row.get("tx_index")?,
            index_block_hash: StacksBlockId::from_column(row, "index_block_hash")?,
            block_hash: BlockHeaderHash::from_column(row, "block_hash")?,
            block_height: u64::from_column(row, "block_height")?,
            burn_block_time: u64::from_column(row, "burn_block_time")?,
            microblock_hash: BlockHeaderHash::from_column(row, "microblock_hash")?,
            microblock_sequence: row.get("microblock_sequence")?,
            tx_type: row.get("tx_type")?,
            raw_tx: row.get("raw_tx")?,
            sender_address: StacksAddress::from_column(row, "sender_address")?,
            nonce: u64::from_column(row, "nonce")?,
            sponsor_address: StacksAddress::from_column(row, "sponsor_address")?,
            sponsor_nonce: u64::from_column(row, "sponsor_nonce")?,
            fee_rate: u64::from_column(row, "fee_rate")?,
            status: row.get("status")?,
            token_transfer_recipient: row.get("token_transfer_recipient")?,
            contract_id: row.get("contract_id")?,
            canonical: row.get("canonical")?,
            microblock_canonical: row.get("microblock_canonical")?,
        })
    }
}

impl ChainStateDB {
    pub fn insert_tx(
        tx: &DBTx,
        data: &TransactionData,
        placement: &TxPlacement,
    ) -> Result<(), db_error> {
        let sponsor_nonce = opt_u64_to_sql(data.sponsor_nonce)?;
        let args: &[&dyn ToSql] = &[
            &data.tx_id,
            &data.tx_index,
            &placement.index_block_hash,
            &placement.block_hash,
            &placement.parent_index_block_hash,
            &u64_to_sql(placement.block_height)?,
            &u64_to_sql(placement.burn_block_time)?,
            &placement.microblock_hash,
            &placement.microblock_sequence,
            &data.tx_type,
            &data.raw_tx,
            &data.sender_address,
            &u64_to_sql(data.nonce)?,
            &data.sponsor_address,
            &sponsor_nonce,
            &u64_to_sql(data.fee_rate)?,
            &data.status,
            &data.token_transfer_recipient,
            &data.contract_id,
            &placement.canonical,
            &placement.microblock_canonical,
        ];
        tx.execute(
            "INSERT OR IGNORE INTO txs
                (tx_id, tx_index, index_block_hash, block_hash, parent_index_block_hash,
                 block_height, burn_block_time, microblock_hash, microblock_sequence, tx_type,
                 raw_tx, sender_address, nonce, sponsor_address, sponsor_nonce, fee_rate, status,
                 token_transfer_recipient, contract_id, canonical, microblock_canonical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            args,
        )?;
        Ok(())
    }

    pub fn insert_event(
        tx: &DBTx,
        event: &EventData,
        tx_index: u32,
        placement: &TxPlacement,
    ) -> Result<(), db_error> {
        let args: &[&dyn ToSql] = &[
            &event.tx_id,
            &event.event_index,
            &tx_index,
            &placement.index_block_hash,
            &placement.parent_index_block_hash,
            &u64_to_sql(placement.block_height)?,
            &placement.microblock_hash,
            &placement.microblock_sequence,
            &event.event_type,
            &event.asset_identifier,
            &event.sender,
            &event.recipient,
            &event.amount,
            &event.value,
            &event.contract_identifier,
            &event.topic,
            &placement.canonical,
            &placement.microblock_canonical,
        ];
        tx.execute(
            "INSERT OR IGNORE INTO events
                (tx_id, event_index, tx_index, index_block_hash, parent_index_block_hash,
                 block_height, microblock_hash, microblock_sequence, event_type, asset_identifier,
                 sender, recipient, amount, value, contract_identifier, topic, canonical,
                 microblock_canonical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            args,
        )?;
        Ok(())
    }

    /// Is this transaction on the canonical chain, counting microblock-streamed
    /// transactions that no anchor block has confirmed yet?
    pub fn is_tx_chain_visible(conn: &DBConn, txid: &Txid) -> Result<bool, db_error> {
        let sql = "SELECT 1 FROM txs WHERE tx_id = ?1 AND canonical = 1 AND microblock_canonical = 1 LIMIT 1";
        let found: Option<i64> = query_row(conn, sql, params![txid])?;
        Ok(found.is_some())
    }

    /// The subset of `txids` that are visible on the canonical chain.
    pub fn get_visible_txids(conn: &DBConn, txids: &[Txid]) -> Result<HashSet<Txid>, db_error> {
        let mut visible = HashSet::new();
        for chunk in txids.chunks(TXID_QUERY_CHUNK) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT DISTINCT tx_id FROM txs
                 WHERE tx_id IN ({placeholders}) AND canonical = 1 AND microblock_canonical = 1"
            );
            let args: Vec<&dyn ToSql> = chunk.iter().map(|t| t as &dyn ToSql).collect();
            let rows: Vec<Txid> = query_rows(conn, &sql, args.as_slice())?;
            visible.extend(rows);
        }
        Ok(visible)
    }

    /// Transactions stored against any of `blocks`, or streamed on top of them.
    pub fn get_txids_for_blocks(
        conn: &DBConn,
        blocks: &[StacksBlockId],
    ) -> Result<Vec<Txid>, db_error> {
        let sql = "SELECT DISTINCT tx_id FROM txs
                   WHERE index_block_hash = ?1
                      OR (index_block_hash = ?2 AND parent_index_block_hash = ?1)";
        let mut txids = vec![];
        for block in blocks.iter() {
            let mut rows: Vec<Txid> = query_rows(conn, sql, params![block, UNCONFIRMED_INDEX_BLOCK_HASH])?;
            txids.append(&mut rows);
        }
        Ok(txids)
    }

    /// The row to report for a transaction on the canonical chain.  Unless
    /// `include_unanchored`, streamed transactions only count once an anchor block confirms them.
    pub fn get_visible_tx(
        conn: &DBConn,
        txid: &Txid,
        include_unanchored: bool,
    ) -> Result<Option<StacksTransactionInfo>, db_error> {
        let sql = "SELECT * FROM txs
                   WHERE tx_id = ?1 AND canonical = 1 AND microblock_canonical = 1
                     AND (?2 OR index_block_hash != ?3)
                   ORDER BY block_height DESC, index_block_hash = ?3 ASC
                   LIMIT 1";
        query_row(
            conn,
            sql,
            params![txid, include_unanchored, UNCONFIRMED_INDEX_BLOCK_HASH],
        )
    }

    /// Most recent row for a transaction regardless of canonical status.
    pub fn get_latest_tx_row(
        conn: &DBConn,
        txid: &Txid,
    ) -> Result<Option<StacksTransactionInfo>, db_error> {
        let sql = "SELECT * FROM txs WHERE tx_id = ?1 ORDER BY block_height DESC, rowid DESC LIMIT 1";
        query_row(conn, sql, params![txid])
    }

    /// A visible transaction, other than `txid`, that spends the sender nonce or the payer nonce.
    /// An account's nonce is shared between its origin and sponsor roles.
    pub fn get_visible_conflicting_tx(
        conn: &DBConn,
        txid: &Txid,
        sender: &StacksAddress,
        nonce: u64,
        payer: &StacksAddress,
        payer_nonce: u64,
    ) -> Result<Option<Txid>, db_error> {
        let sql = "SELECT tx_id FROM txs
                   WHERE tx_id != ?1 AND canonical = 1 AND microblock_canonical = 1
                     AND ((sender_address = ?2 AND nonce = ?3)
                       OR (sponsor_address = ?2 AND sponsor_nonce = ?3)
                       OR (sender_address = ?4 AND nonce = ?5)
                       OR (sponsor_address = ?4 AND sponsor_nonce = ?5))
                   ORDER BY block_height ASC
                   LIMIT 1";
        query_row(
            conn,
            sql,
            params![
                txid,
                sender,
                u64_to_sql(nonce)?,
                payer,
                u64_to_sql(payer_nonce)?
            ],
        )
    }

    /// Highest nonce `address` has used in a canonical, confirmed transaction, as sender or sponsor.
    pub fn get_last_executed_nonce(
        conn: &DBConn,
        address: &StacksAddress,
        include_unanchored: bool,
    ) -> Result<Option<u64>, db_error> {
        let sql = "SELECT MAX(n) FROM (
                       SELECT nonce AS n FROM txs
                       WHERE sender_address = ?1 AND canonical = 1 AND microblock_canonical = 1
                         AND (?2 OR index_block_hash != ?3)
                       UNION ALL
                       SELECT sponsor_nonce AS n FROM txs
                       WHERE sponsor_address = ?1 AND canonical = 1 AND microblock_canonical = 1
                         AND (?2 OR index_block_hash != ?3)
                   )";
        let nonce: Option<i64> = conn.query_row(
            sql,
            params![address, include_unanchored, UNCONFIRMED_INDEX_BLOCK_HASH],
            |row| row.get(0),
        )?;
        nonce
            .map(|n| u64::try_from(n).map_err(|_| db_error::ParseError))
            .transpose()
    }

    /// Identifies the most recent canonical transaction and event touching `address`,
    /// for building address-scoped cache validators.
    pub fn get_latest_address_activity(
        conn: &DBConn,
        address: &str,
    ) -> Result<(Option<(Txid, StacksBlockId, BlockHeaderHash)>, Option<(Txid, StacksBlockId, u32)>), db_error> {
        let tx_sql = "SELECT tx_id, index_block_hash, microblock_hash FROM txs
                      WHERE canonical = 1 AND microblock_canonical = 1
                        AND (sender_address = ?1 OR sponsor_address = ?1 OR token_transfer_recipient = ?1)
                      ORDER BY block_height DESC, microblock_sequence DESC, tx_index DESC
                      LIMIT 1";
        let latest_tx = query_row::<LatestTxActivity, _>(conn, tx_sql, params![address])?
            .map(|a| (a.0, a.1, a.2));

        let event_sql = "SELECT tx_id, index_block_hash, event_index FROM events
                         WHERE canonical = 1 AND microblock_canonical = 1
                           AND (sender = ?1 OR recipient = ?1)
                         ORDER BY block_height DESC, microblock_sequence DESC, tx_index DESC, event_index DESC
                         LIMIT 1";
        let latest_event = query_row::<LatestEventActivity, _>(conn, event_sql, params![address])?
            .map(|a| (a.0, a.1, a.2));

        Ok((latest_tx, latest_event))
    }
}

struct LatestTxActivity(Txid, StacksBlockId, BlockHeaderHash);
struct LatestEventActivity(Txid, StacksBlockId, u32);

impl FromRow<LatestTxActivity> for LatestTxActivity {
    fn from_row(row: &Row) -> Result<LatestTxActivity, db_error> {
        Ok(LatestTxActivity(
            row.get("tx_id")?,
            row.get("index_block_hash")?,
            row.get("microblock_hash")?,
        ))
    }
}

impl FromRow<LatestEventActivity> for LatestEventActivity {
    fn from_row(row: &Row) -> Result<LatestEventActivity, db_error> {
        Ok(LatestEventActivity(
            row.get("tx_id")?,
            row.get("index_block_hash")?,
            row.get("event_index")?,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chainstate::coordinator::tests::{make_block, make_tx};

    const SENDER: &str = "SP000000000000000000002Q6VF78";

    #[test]
    fn test_visible_txids_over_many_candidates() {
        let mut chainstate = ChainStateDB::open_test();
        let mut canonical = make_block(1, 0x01, 0x00);
        canonical.txs.push(make_tx(0x10, SENDER, 0, 10));
        let mut second = make_tx(0x11, SENDER, 1, 10);
        second.tx_index = 1;
        canonical.txs.push(second);
        let mut sibling = make_block(1, 0x02, 0x00);
        sibling.txs.push(make_tx(0x12, SENDER, 0, 10));

        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_block(&tx, &canonical).unwrap();
        ChainStateDB::insert_block(&tx, &sibling).unwrap();
        ChainStateDB::set_block_canonical(&tx, &canonical.block.index_block_hash, true).unwrap();
        tx.commit().unwrap();

        let conn = chainstate.conn();
        assert!(ChainStateDB::get_visible_txids(conn, &[]).unwrap().is_empty());
        let visible = ChainStateDB::get_visible_txids(
            conn,
            &[Txid([0x10; 32]), Txid([0x12; 32]), Txid([0x13; 32]), Txid([0x10; 32])],
        )
        .unwrap();
        assert_eq!(visible, HashSet::from([Txid([0x10; 32])]));

        // more candidates than one query binds, with a hit past the first batch
        let mut candidates: Vec<Txid> = (0..TXID_QUERY_CHUNK as u16 + 100)
            .map(|i| {
                let mut bytes = [0xee; 32];
                bytes[..2].copy_from_slice(&i.to_be_bytes());
                Txid(bytes)
            })
            .collect();
        candidates.insert(TXID_QUERY_CHUNK + 50, Txid([0x11; 32]));
        candidates.push(Txid([0x10; 32]));
        let visible = ChainStateDB::get_visible_txids(conn, &candidates).unwrap();
        assert_eq!(visible, HashSet::from([Txid([0x10; 32]), Txid([0x11; 32])]));
    }
}
