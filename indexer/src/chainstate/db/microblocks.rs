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
use indexer_common::types::chainstate::{BlockHeaderHash, StacksBlockId};
use rusqlite::{params, Row, ToSql};

use crate::chainstate::db::transactions::TxPlacement;
use crate::chainstate::db::{ChainStateDB, StacksBlockHeaderInfo};
use crate::chainstate::{BlockIngest, Error, MicroblockData, MicroblockStream};
use crate::util_lib::db::{
    query_row, query_rows, u64_to_sql, DBConn, DBTx, Error as db_error, FromColumn, FromRow,
};

/// A stored microblock row.  Unconfirmed rows carry the all-zero `index_block_hash`;
/// a confirmed microblock has one row per anchor block that accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedMicroblockInfo {
    pub microblock: MicroblockData,
    pub index_block_hash: StacksBlockId,
    pub block_hash: BlockHeaderHash,
    pub block_height: u64,
    pub canonical: bool,
    pub microblock_canonical: bool,
}

impl StreamedMicroblockInfo {
    pub fn is_confirmed(&self) -> bool {
        !self.index_block_hash.is_zero()
    }
}

impl FromRow<StreamedMicroblockInfo> for StreamedMicroblockInfo {
    fn from_row(row: &Row) -> Result<StreamedMicroblockInfo, db_error> {
        let microblock = MicroblockData {
            microblock_hash: BlockHeaderHash::from_column(row, "microblock_hash")?,
            microblock_sequence: row.get("microblock_sequence")?,
            microblock_parent_hash: BlockHeaderHash::from_column(row, "microblock_parent_hash")?,
            parent_index_block_hash: StacksBlockId::from_column(row, "parent_index_block_hash")?,
            receive_time: u64::from_column(row, "receive_time")?,
        };
        Ok(StreamedMicroblockInfo {
            microblock,
            index_block_hash: StacksBlockId::from_column(row, "index_block_hash")?,
            block_hash: BlockHeaderHash::from_column(row, "block_hash")?,
            block_height: u64::from_column(row, "block_height")?,
            canonical: row.get("canonical")?,
            microblock_canonical: row.get("microblock_canonical")?,
        })
    }
}

/// Outcome of storing one streamed microblock.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMicroblock {
    pub microblock_hash: BlockHeaderHash,
    pub microblock_sequence: u32,
    pub microblock_canonical: bool,
}

const STREAMED_TX_COLUMNS: &str = "tx_id, tx_index, index_block_hash, block_hash, parent_index_block_hash,
    block_height, burn_block_time, microblock_hash, microblock_sequence, tx_type, raw_tx,
    sender_address, nonce, sponsor_address, sponsor_nonce, fee_rate, status,
    token_transfer_recipient, contract_id, canonical, microblock_canonical";

const STREAMED_EVENT_COLUMNS: &str = "tx_id, event_index, tx_index, index_block_hash,
    parent_index_block_hash, block_height, microblock_hash, microblock_sequence, event_type,
    asset_identifier, sender, recipient, amount, value, contract_identifier, topic, canonical,
    microblock_canonical";

impl ChainStateDB {
    /// Any stored row for a microblock in `anchor`'s stream, preferring the unconfirmed one.
    pub fn get_stream_microblock(
        conn: &DBConn,
        anchor: &StacksBlockId,
        microblock_hash: &BlockHeaderHash,
    ) -> Result<Option<StreamedMicroblockInfo>, db_error> {
        let sql = "SELECT * FROM microblocks
                   WHERE parent_index_block_hash = ?1 AND microblock_hash = ?2
                   ORDER BY index_block_hash = ?3 DESC
                   LIMIT 1";
        query_row(
            conn,
            sql,
            params![anchor, microblock_hash, UNCONFIRMED_INDEX_BLOCK_HASH],
        )
    }

    /// Unconfirmed microblocks streamed on top of `anchor`, in sequence order.
    #[cfg(test)]
    pub fn get_unconfirmed_stream(
        conn: &DBConn,
        anchor: &StacksBlockId,
    ) -> Result<Vec<StreamedMicroblockInfo>, db_error> {
        let sql = "SELECT * FROM microblocks
                   WHERE parent_index_block_hash = ?1 AND index_block_hash = ?2
                   ORDER BY microblock_sequence ASC, receive_time ASC";
        query_rows(conn, sql, params![anchor, UNCONFIRMED_INDEX_BLOCK_HASH])
    }

    /// Microblocks accepted by `index_block_hash`, in sequence order.
    #[cfg(test)]
    pub fn get_accepted_microblocks(
        conn: &DBConn,
        index_block_hash: &StacksBlockId,
    ) -> Result<Vec<StreamedMicroblockInfo>, db_error> {
        let sql = "SELECT * FROM microblocks WHERE index_block_hash = ?1 ORDER BY microblock_sequence ASC";
        query_rows(conn, sql, params![index_block_hash])
    }

    /// Tail of the microblock-canonical unconfirmed stream on top of `anchor`.
    pub fn get_latest_unconfirmed_microblock(
        conn: &DBConn,
        anchor: &StacksBlockId,
    ) -> Result<Option<StreamedMicroblockInfo>, db_error> {
        let sql = "SELECT * FROM microblocks
                   WHERE parent_index_block_hash = ?1 AND index_block_hash = ?2
                     AND microblock_canonical = 1
                   ORDER BY microblock_sequence DESC
                   LIMIT 1";
        query_row(conn, sql, params![anchor, UNCONFIRMED_INDEX_BLOCK_HASH])
    }

    fn has_canonical_child(conn: &DBConn, anchor: &StacksBlockId) -> Result<bool, db_error> {
        let sql = "SELECT 1 FROM blocks WHERE parent_index_block_hash = ?1 AND canonical = 1 LIMIT 1";
        let found: Option<i64> = query_row(conn, sql, params![anchor])?;
        Ok(found.is_some())
    }

    fn has_sequence_conflict(
        conn: &DBConn,
        anchor: &StacksBlockId,
        microblock: &MicroblockData,
    ) -> Result<bool, db_error> {
        let sql = "SELECT 1 FROM microblocks
                   WHERE parent_index_block_hash = ?1 AND microblock_sequence = ?2
                     AND microblock_hash != ?3
                   LIMIT 1";
        let found: Option<i64> = query_row(
            conn,
            sql,
            params![anchor, microblock.microblock_sequence, microblock.microblock_hash],
        )?;
        Ok(found.is_some())
    }

    fn insert_microblock_row(
        tx: &DBTx,
        microblock: &MicroblockData,
        index_block_hash: &StacksBlockId,
        block_hash: &BlockHeaderHash,
        block_height: u64,
        canonical: bool,
        microblock_canonical: bool,
    ) -> Result<(), db_error> {
        let args: &[&dyn ToSql] = &[
            &microblock.microblock_hash,
            &microblock.microblock_sequence,
            &microblock.microblock_parent_hash,
            &microblock.parent_index_block_hash,
            index_block_hash,
            block_hash,
            &u64_to_sql(block_height)?,
            &u64_to_sql(microblock.receive_time)?,
            &canonical,
            &microblock_canonical,
        ];
        tx.execute(
            "INSERT OR REPLACE INTO microblocks
                (microblock_hash, microblock_sequence, microblock_parent_hash, parent_index_block_hash,
                 index_block_hash, block_hash, block_height, receive_time, canonical, microblock_canonical)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            args,
        )?;
        Ok(())
    }

    /// Store an unconfirmed microblock on top of `anchor`.  The first microblock seen at a
    /// sequence wins; later ones at the same sequence, descendants of a losing microblock, and
    /// microblocks that extend a stream some canonical child of the anchor already confirmed
    /// are stored as micro-forks.
    pub fn insert_unconfirmed_microblock(
        tx: &DBTx,
        anchor: &StacksBlockHeaderInfo,
        microblock: &MicroblockData,
    ) -> Result<Option<StoredMicroblock>, Error> {
        let anchor_id = anchor.index_block_hash();
        if ChainStateDB::get_stream_microblock(tx, anchor_id, &microblock.microblock_hash)?
            .is_some()
        {
            test_debug!("Microblock already stored"; "microblock_hash" => %microblock.microblock_hash);
            return Ok(None);
        }

        let parent_canonical = if microblock.microblock_sequence == 0 {
            if microblock.microblock_parent_hash != anchor.block.block_hash {
                return Err(Error::InvalidData(format!(
                    "microblock {} at sequence 0 does not build on anchor {}",
                    microblock.microblock_hash, anchor.block.block_hash
                )));
            }
            true
        } else {
            let parent = ChainStateDB::get_stream_microblock(
                tx,
                anchor_id,
                &microblock.microblock_parent_hash,
            )?
            .ok_or_else(|| {
                Error::UnknownParentMicroblock(*anchor_id, microblock.microblock_parent_hash)
            })?;
            if parent.microblock.microblock_sequence.checked_add(1)
                != Some(microblock.microblock_sequence)
            {
                return Err(Error::InvalidData(format!(
                    "microblock {} has sequence {}, parent has {}",
                    microblock.microblock_hash,
                    microblock.microblock_sequence,
                    parent.microblock.microblock_sequence
                )));
            }
            // a parent only held by accepting blocks is decided by the canonical-child check
            parent.is_confirmed() || parent.microblock_canonical
        };

        let microblock_canonical = parent_canonical
            && !ChainStateDB::has_sequence_conflict(tx, anchor_id, microblock)?
            && !ChainStateDB::has_canonical_child(tx, anchor_id)?;

        ChainStateDB::insert_microblock_row(
            tx,
            microblock,
            &UNCONFIRMED_INDEX_BLOCK_HASH,
            &BlockHeaderHash::sentinel(),
            anchor.block_height() + 1,
            anchor.canonical,
            microblock_canonical,
        )?;

        if !microblock_canonical {
            info!("Stored micro-forked microblock";
                  "anchor" => %anchor_id,
                  "microblock_hash" => %microblock.microblock_hash,
                  "microblock_sequence" => microblock.microblock_sequence);
        }

        Ok(Some(StoredMicroblock {
            microblock_hash: microblock.microblock_hash,
            microblock_sequence: microblock.microblock_sequence,
            microblock_canonical,
        }))
    }

    /// Store a batch of streamed microblocks, with their transactions and events.
    pub fn insert_microblock_stream(
        tx: &DBTx,
        stream: &MicroblockStream,
    ) -> Result<Vec<StoredMicroblock>, Error> {
        let anchor = ChainStateDB::get_block(tx, &stream.parent_index_block_hash)?
            .ok_or(Error::UnknownParentBlock(stream.parent_index_block_hash))?;

        for tx_data in stream.txs.iter() {
            let in_stream = tx_data.microblock_hash.map_or(false, |h| {
                stream.microblocks.iter().any(|m| m.microblock_hash == h)
            });
            if !in_stream {
                return Err(Error::InvalidData(format!(
                    "streamed transaction {} names no microblock in this stream",
                    tx_data.tx_id
                )));
            }
        }

        let mut microblocks: Vec<&MicroblockData> = stream.microblocks.iter().collect();
        microblocks.sort_by_key(|m| m.microblock_sequence);

        let mut stored = vec![];
        for microblock in microblocks.into_iter() {
            if microblock.parent_index_block_hash != stream.parent_index_block_hash {
                return Err(Error::InvalidData(format!(
                    "microblock {} does not stream from {}",
                    microblock.microblock_hash, stream.parent_index_block_hash
                )));
            }
            let Some(outcome) = ChainStateDB::insert_unconfirmed_microblock(tx, &anchor, microblock)?
            else {
                continue;
            };
            for tx_data in stream
                .txs
                .iter()
                .filter(|t| t.microblock_hash == Some(microblock.microblock_hash))
            {
                let placement = TxPlacement::unconfirmed_stream(
                    &anchor.block,
                    anchor.canonical,
                    &microblock.microblock_hash,
                    microblock.microblock_sequence,
                    outcome.microblock_canonical,
                );
                ChainStateDB::insert_tx(tx, tx_data, &placement)?;
                for event in stream.events.iter().filter(|e| e.tx_id == tx_data.tx_id) {
                    ChainStateDB::insert_event(tx, event, tx_data.tx_index, &placement)?;
                }
            }
            stored.push(outcome);
        }
        Ok(stored)
    }

    /// Accept the parent's microblock stream up to the tail `ingest` names.  Microblocks
    /// shipped with the block are stored into the stream first.  Returns the accepted
    /// microblocks in sequence order.
    ///
    /// Acceptance relocates rows rather than flagging them: each accepted microblock, its
    /// transactions and its events get rows of their own under the new block, and only the
    /// unconfirmed copies (keyed by the all-zero `index_block_hash`) are deleted.  Rows
    /// relocated under a block are never deleted afterwards.  A reorg flips their
    /// `canonical` flag along with the block's, and a sibling that accepts the same stream
    /// later copies from them.
    pub fn accept_parent_microblocks(
        tx: &DBTx,
        ingest: &BlockIngest,
    ) -> Result<Vec<MicroblockData>, Error> {
        let block = &ingest.block;
        if !block.confirms_microblocks() {
            return Ok(vec![]);
        }
        let parent_id = block.parent_index_block_hash;
        let parent = ChainStateDB::get_block(tx, &parent_id)?
            .ok_or(Error::UnknownParentBlock(parent_id))?;

        let mut shipped: Vec<&MicroblockData> = ingest.microblocks.iter().collect();
        shipped.sort_by_key(|m| m.microblock_sequence);
        for microblock in shipped.into_iter() {
            ChainStateDB::insert_unconfirmed_microblock(tx, &parent, microblock)?;
        }

        // walk back from the tail to sequence 0
        let mut accepted: Vec<MicroblockData> = vec![];
        let mut cursor = block.parent_microblock_hash;
        loop {
            let row = ChainStateDB::get_stream_microblock(tx, &parent_id, &cursor)?
                .ok_or(Error::UnknownParentMicroblock(parent_id, cursor))?;
            let microblock = row.microblock;
            if let Some(prev) = accepted.last() {
                if microblock.microblock_sequence.checked_add(1) != Some(prev.microblock_sequence) {
                    return Err(Error::InvalidData(format!(
                        "microblock {} breaks the sequence of the stream accepted by {}",
                        microblock.microblock_hash, block.index_block_hash
                    )));
                }
            } else if microblock.microblock_sequence != block.parent_microblock_sequence {
                return Err(Error::InvalidData(format!(
                    "block {} accepts microblock {} at sequence {}, stored at {}",
                    block.index_block_hash,
                    cursor,
                    block.parent_microblock_sequence,
                    microblock.microblock_sequence
                )));
            }
            let done = microblock.microblock_sequence == 0;
            cursor = microblock.microblock_parent_hash;
            accepted.push(microblock);
            if done {
                break;
            }
        }
        accepted.reverse();

        for microblock in accepted.iter() {
            ChainStateDB::insert_microblock_row(
                tx,
                microblock,
                &block.index_block_hash,
                &block.block_hash,
                block.block_height,
                false,
                true,
            )?;

            let placement = TxPlacement::confirmed_stream(
                block,
                &microblock.microblock_hash,
                microblock.microblock_sequence,
            );
            for tx_data in ingest
                .txs
                .iter()
                .filter(|t| t.microblock_hash == Some(microblock.microblock_hash))
            {
                ChainStateDB::insert_tx(tx, tx_data, &placement)?;
                for event in ingest.events.iter().filter(|e| e.tx_id == tx_data.tx_id) {
                    ChainStateDB::insert_event(tx, event, tx_data.tx_index, &placement)?;
                }
            }
            ChainStateDB::copy_streamed_rows(tx, &parent_id, &microblock.microblock_hash, &placement)?;
        }

        for table in ["microblocks", "txs", "events"] {
            let sql = format!(
                "DELETE FROM {table}
                 WHERE index_block_hash = ?1 AND parent_index_block_hash = ?2 AND microblock_hash = ?3"
            );
            for microblock in accepted.iter() {
                tx.execute(
                    &sql,
                    params![UNCONFIRMED_INDEX_BLOCK_HASH, parent_id, microblock.microblock_hash],
                )?;
            }
        }

        debug!("Accepted parent microblocks";
               "index_block_hash" => %block.index_block_hash,
               "parent_index_block_hash" => %parent_id,
               "count" => accepted.len());
        Ok(accepted)
    }

    /// Copy the transactions and events already stored for a streamed microblock, whether
    /// unconfirmed or accepted by another block, into `placement`.
    fn copy_streamed_rows(
        tx: &DBTx,
        anchor: &StacksBlockId,
        microblock_hash: &BlockHeaderHash,
        placement: &TxPlacement,
    ) -> Result<(), db_error> {
        let tx_sql = format!(
            "INSERT OR IGNORE INTO txs ({STREAMED_TX_COLUMNS})
             SELECT tx_id, tx_index, ?1, ?2, parent_index_block_hash, ?3, ?4, microblock_hash,
                    microblock_sequence, tx_type, raw_tx, sender_address, nonce, sponsor_address,
                    sponsor_nonce, fee_rate, status, token_transfer_recipient, contract_id, ?5, 1
             FROM txs
             WHERE parent_index_block_hash = ?6 AND microblock_hash = ?7 AND index_block_hash != ?1"
        );
        let args: &[&dyn ToSql] = &[
            &placement.index_block_hash,
            &placement.block_hash,
            &u64_to_sql(placement.block_height)?,
            &u64_to_sql(placement.burn_block_time)?,
            &placement.canonical,
            anchor,
            microblock_hash,
        ];
        tx.execute(&tx_sql, args)?;

        let event_sql = format!(
            "INSERT OR IGNORE INTO events ({STREAMED_EVENT_COLUMNS})
             SELECT tx_id, event_index, tx_index, ?1, parent_index_block_hash, ?2, microblock_hash,
                    microblock_sequence, event_type, asset_identifier, sender, recipient, amount,
                    value, contract_identifier, topic, ?3, 1
             FROM events
             WHERE parent_index_block_hash = ?4 AND microblock_hash = ?5 AND index_block_hash != ?1"
        );
        let args: &[&dyn ToSql] = &[
            &placement.index_block_hash,
            &u64_to_sql(placement.block_height)?,
            &placement.canonical,
            anchor,
            microblock_hash,
        ];
        tx.execute(&event_sql, args)?;
        Ok(())
    }

    /// Once a canonical block has accepted part of `anchor`'s stream, whatever remains
    /// unconfirmed in that stream can never be accepted on the canonical chain.  Marks it
    /// microblock-non-canonical and returns the microblocks that were canonical before.
    pub fn orphan_unaccepted_microblocks(
        tx: &DBTx,
        anchor: &StacksBlockId,
    ) -> Result<Vec<BlockHeaderHash>, db_error> {
        let sql = "SELECT microblock_hash FROM microblocks
                   WHERE index_block_hash = ?1 AND parent_index_block_hash = ?2
                     AND microblock_canonical = 1
                   ORDER BY microblock_sequence ASC";
        let orphaned: Vec<BlockHeaderHash> =
            query_rows(tx, sql, params![UNCONFIRMED_INDEX_BLOCK_HASH, anchor])?;
        if orphaned.is_empty() {
            return Ok(orphaned);
        }
        for table in ["microblocks", "txs", "events"] {
            let sql = format!(
                "UPDATE {table} SET microblock_canonical = 0
                 WHERE index_block_hash = ?1 AND parent_index_block_hash = ?2"
            );
            tx.execute(&sql, params![UNCONFIRMED_INDEX_BLOCK_HASH, anchor])?;
        }
        debug!("Orphaned unaccepted microblocks"; "anchor" => %anchor, "count" => orphaned.len());
        Ok(orphaned)
    }
}

#[cfg(test)]
mod test {
    use indexer_common::types::chainstate::Txid;

    use super::*;
    use crate::chainstate::coordinator::tests::{make_block, make_microblock, make_tx};
    use crate::util_lib::db::query_count;

    fn setup() -> (ChainStateDB, BlockIngest) {
        let mut chainstate = ChainStateDB::open_test();
        let genesis = make_block(1, 0x01, 0x00);
        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_block(&tx, &genesis).unwrap();
        ChainStateDB::set_block_canonical(&tx, &genesis.block.index_block_hash, true).unwrap();
        tx.commit().unwrap();
        (chainstate, genesis)
    }

    #[test]
    fn test_first_seen_microblock_wins() {
        let (mut chainstate, genesis) = setup();
        let anchor = &genesis.block;
        let mb_a = make_microblock(anchor, 0xa0, 0, None);
        let mb_b = make_microblock(anchor, 0xb0, 0, None);
        let mb_a1 = make_microblock(anchor, 0xa1, 1, Some(&mb_a));
        let mb_b1 = make_microblock(anchor, 0xb1, 1, Some(&mb_b));

        let stream = MicroblockStream {
            parent_index_block_hash: anchor.index_block_hash,
            microblocks: vec![mb_a1.clone(), mb_a.clone(), mb_b.clone(), mb_b1.clone()],
            txs: vec![],
            events: vec![],
        };
        let tx = chainstate.tx_begin().unwrap();
        let stored = ChainStateDB::insert_microblock_stream(&tx, &stream).unwrap();
        tx.commit().unwrap();

        let canonical: Vec<_> = stored
            .iter()
            .filter(|s| s.microblock_canonical)
            .map(|s| s.microblock_hash)
            .collect();
        // sorted by sequence, so mb_a (listed first) is seen before mb_b
        assert_eq!(canonical, vec![mb_a.microblock_hash, mb_a1.microblock_hash]);
        let tail = ChainStateDB::get_latest_unconfirmed_microblock(
            chainstate.conn(),
            &anchor.index_block_hash,
        )
        .unwrap()
        .unwrap();
        assert_eq!(tail.microblock.microblock_hash, mb_a1.microblock_hash);
        assert!(tail.canonical);
    }

    #[test]
    fn test_unknown_parent_microblock() {
        let (mut chainstate, genesis) = setup();
        let anchor = &genesis.block;
        let mb_a = make_microblock(anchor, 0xa0, 0, None);
        let mb_a1 = make_microblock(anchor, 0xa1, 1, Some(&mb_a));
        let stream = MicroblockStream {
            parent_index_block_hash: anchor.index_block_hash,
            microblocks: vec![mb_a1],
            txs: vec![],
            events: vec![],
        };
        let tx = chainstate.tx_begin().unwrap();
        let err = ChainStateDB::insert_microblock_stream(&tx, &stream).unwrap_err();
        assert!(matches!(err, Error::UnknownParentMicroblock(..)));
    }

    #[test]
    fn test_accept_relocates_streamed_rows() {
        let (mut chainstate, genesis) = setup();
        let anchor = &genesis.block;
        let mb_a = make_microblock(anchor, 0xa0, 0, None);
        let mb_a1 = make_microblock(anchor, 0xa1, 1, Some(&mb_a));
        let mut streamed = make_tx(0x20, "SP000000000000000000002Q6VF78", 0, 100);
        streamed.microblock_hash = Some(mb_a.microblock_hash);
        let mut late = make_tx(0x21, "SP000000000000000000002Q6VF78", 1, 100);
        late.microblock_hash = Some(mb_a1.microblock_hash);

        let stream = MicroblockStream {
            parent_index_block_hash: anchor.index_block_hash,
            microblocks: vec![mb_a.clone(), mb_a1.clone()],
            txs: vec![streamed.clone(), late.clone()],
            events: vec![],
        };
        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_microblock_stream(&tx, &stream).unwrap();
        tx.commit().unwrap();

        assert!(ChainStateDB::is_tx_chain_visible(chainstate.conn(), &Txid([0x20; 32])).unwrap());
        assert!(ChainStateDB::get_visible_tx(chainstate.conn(), &Txid([0x20; 32]), false)
            .unwrap()
            .is_none());

        // block 2 accepts only mb_a
        let mut child = make_block(2, 0x02, 0x01);
        child.block.parent_microblock_hash = mb_a.microblock_hash;
        child.block.parent_microblock_sequence = 0;

        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_block(&tx, &child).unwrap();
        let accepted = ChainStateDB::accept_parent_microblocks(&tx, &child).unwrap();
        ChainStateDB::set_block_canonical(&tx, &child.block.index_block_hash, true).unwrap();
        let orphaned =
            ChainStateDB::orphan_unaccepted_microblocks(&tx, &anchor.index_block_hash).unwrap();
        tx.commit().unwrap();

        assert_eq!(accepted, vec![mb_a.clone()]);
        assert_eq!(orphaned, vec![mb_a1.microblock_hash]);

        let conn = chainstate.conn();
        let confirmed = ChainStateDB::get_visible_tx(conn, &Txid([0x20; 32]), false)
            .unwrap()
            .unwrap();
        assert_eq!(confirmed.index_block_hash, child.block.index_block_hash);
        assert_eq!(confirmed.microblock_hash, mb_a.microblock_hash);
        assert!(!ChainStateDB::is_tx_chain_visible(conn, &Txid([0x21; 32])).unwrap());
        assert_eq!(
            ChainStateDB::get_accepted_microblocks(conn, &child.block.index_block_hash)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            ChainStateDB::get_unconfirmed_stream(conn, &anchor.index_block_hash)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_accept_with_broken_stream() {
        let (mut chainstate, genesis) = setup();
        let mut child = make_block(2, 0x02, 0x01);
        child.block.parent_microblock_hash = BlockHeaderHash([0xee; 32]);
        child.block.parent_microblock_sequence = 3;
        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_block(&tx, &child).unwrap();
        let err = ChainStateDB::accept_parent_microblocks(&tx, &child).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownParentMicroblock(anchor, _) if anchor == genesis.block.index_block_hash
        ));
    }

    #[test]
    fn test_accepted_rows_kept_across_reorg() {
        let (mut chainstate, genesis) = setup();
        let anchor = &genesis.block;
        let mb_a = make_microblock(anchor, 0xa0, 0, None);
        let mut streamed = make_tx(0x20, "SP000000000000000000002Q6VF78", 0, 100);
        streamed.microblock_hash = Some(mb_a.microblock_hash);
        let stream = MicroblockStream {
            parent_index_block_hash: anchor.index_block_hash,
            microblocks: vec![mb_a.clone()],
            txs: vec![streamed],
            events: vec![],
        };
        let mut child = make_block(2, 0x02, 0x01);
        child.block.parent_microblock_hash = mb_a.microblock_hash;
        child.block.parent_microblock_sequence = 0;
        let mut sibling = make_block(2, 0x12, 0x01);
        sibling.block.parent_microblock_hash = mb_a.microblock_hash;
        sibling.block.parent_microblock_sequence = 0;

        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_microblock_stream(&tx, &stream).unwrap();
        ChainStateDB::insert_block(&tx, &child).unwrap();
        ChainStateDB::accept_parent_microblocks(&tx, &child).unwrap();
        ChainStateDB::set_block_canonical(&tx, &child.block.index_block_hash, true).unwrap();
        tx.commit().unwrap();
        assert!(ChainStateDB::get_unconfirmed_stream(chainstate.conn(), &anchor.index_block_hash)
            .unwrap()
            .is_empty());

        // the sibling takes over; it copies the stream from the child's rows
        let tx = chainstate.tx_begin().unwrap();
        ChainStateDB::insert_block(&tx, &sibling).unwrap();
        let accepted = ChainStateDB::accept_parent_microblocks(&tx, &sibling).unwrap();
        ChainStateDB::set_block_canonical(&tx, &child.block.index_block_hash, false).unwrap();
        ChainStateDB::set_block_canonical(&tx, &sibling.block.index_block_hash, true).unwrap();
        tx.commit().unwrap();
        assert_eq!(accepted, vec![mb_a.clone()]);

        let conn = chainstate.conn();
        let visible = ChainStateDB::get_visible_tx(conn, &Txid([0x20; 32]), false)
            .unwrap()
            .unwrap();
        assert_eq!(visible.index_block_hash, sibling.block.index_block_hash);
        let rows = |sql: &str| query_count(conn, sql, params![Txid([0x20; 32])]).unwrap();
        assert_eq!(rows("SELECT COUNT(*) FROM txs WHERE tx_id = ?1"), 2);
        assert_eq!(rows("SELECT COUNT(*) FROM txs WHERE tx_id = ?1 AND canonical = 0"), 1);
        let kept = ChainStateDB::get_accepted_microblocks(conn, &child.block.index_block_hash).unwrap();
        assert_eq!(kept.len(), 1);
        assert!(!kept[0].canonical && kept[0].microblock_canonical);
    }
}
