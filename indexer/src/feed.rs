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

//! Replay of a node event feed: one JSON object per line, each of the form
//! `{"path": <observer path>, "payload": <body>}`, the same envelope the node
//! POSTs to its event observers.

use std::io::BufRead;

use indexer_common::types::chainstate::Txid;
use indexer_common::util::{backoff_ms, sleep_ms};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::chainstate::coordinator::ChainStateCoordinator;
use crate::chainstate::{BlockIngest, Error, MicroblockStream};
use crate::core::mempool::{MemPoolDropReason, MempoolTxData};
use crate::event_dispatcher::{PATH_MEMPOOL_TX_DROP, PATH_MEMPOOL_TX_SUBMIT};

pub const PATH_BLOCK_PROCESSED: &str = "new_block";
pub const PATH_MICROBLOCK_SUBMIT: &str = "new_microblocks";
pub const PATH_MEMPOOL_GC: &str = "mempool_gc";

const RETRY_SLEEP_CAP_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DroppedTxsPayload {
    pub dropped_txids: Vec<Txid>,
    pub reason: MemPoolDropReason,
    #[serde(default)]
    pub new_txid: Option<Txid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Block(BlockIngest),
    Microblocks(MicroblockStream),
    MempoolSubmit(Vec<MempoolTxData>),
    MempoolDrop(DroppedTxsPayload),
    MempoolGc,
}

#[derive(Deserialize)]
struct Envelope {
    path: String,
    #[serde(default)]
    payload: Value,
}

fn decode<T: DeserializeOwned>(path: &str, payload: Value) -> Result<T, Error> {
    serde_json::from_value(payload)
        .map_err(|e| Error::InvalidData(format!("bad {path} payload: {e}")))
}

impl FeedEvent {
    /// Parse one feed line.  Blank lines yield `None`.
    pub fn from_line(line: &str) -> Result<Option<FeedEvent>, Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let envelope: Envelope = serde_json::from_str(line)
            .map_err(|e| Error::InvalidData(format!("bad feed line: {e}")))?;
        let path = envelope.path.trim_start_matches('/');
        let event = match path {
            PATH_BLOCK_PROCESSED => FeedEvent::Block(decode(path, envelope.payload)?),
            PATH_MICROBLOCK_SUBMIT => FeedEvent::Microblocks(decode(path, envelope.payload)?),
            PATH_MEMPOOL_TX_SUBMIT => FeedEvent::MempoolSubmit(decode(path, envelope.payload)?),
            PATH_MEMPOOL_TX_DROP => FeedEvent::MempoolDrop(decode(path, envelope.payload)?),
            PATH_MEMPOOL_GC => FeedEvent::MempoolGc,
            other => {
                return Err(Error::InvalidData(format!("unknown feed path '{other}'")));
            }
        };
        Ok(Some(event))
    }

    pub fn path(&self) -> &'static str {
        match self {
            FeedEvent::Block(_) => PATH_BLOCK_PROCESSED,
            FeedEvent::Microblocks(_) => PATH_MICROBLOCK_SUBMIT,
            FeedEvent::MempoolSubmit(_) => PATH_MEMPOOL_TX_SUBMIT,
            FeedEvent::MempoolDrop(_) => PATH_MEMPOOL_TX_DROP,
            FeedEvent::MempoolGc => PATH_MEMPOOL_GC,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub lines: u64,
    pub applied: u64,
    pub rejected: u64,
    pub reorgs: u64,
}

pub struct FeedReplayer {
    /// Attempts per event when the store reports a transient failure
    pub max_attempts: u32,
    pub stop_on_error: bool,
}

impl Default for FeedReplayer {
    fn default() -> FeedReplayer {
        FeedReplayer {
            max_attempts: 5,
            stop_on_error: false,
        }
    }
}

impl FeedReplayer {
    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, Error>) -> Result<T, Error> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let sleep_time_ms = backoff_ms(attempt, RETRY_SLEEP_CAP_MS);
                    warn!("Store unavailable; retrying";
                          "attempt" => attempt,
                          "sleep_ms" => sleep_time_ms,
                          "err" => %e);
                    sleep_ms(sleep_time_ms);
                }
                res => return res,
            }
        }
    }

    fn apply(
        &self,
        coord: &mut ChainStateCoordinator,
        event: &FeedEvent,
        summary: &mut ReplaySummary,
    ) -> Result<(), Error> {
        match event {
            FeedEvent::Block(block) => {
                let change = self.with_retry(|| coord.apply_block(block))?;
                if change.is_reorg() {
                    summary.reorgs += 1;
                }
            }
            FeedEvent::Microblocks(stream) => {
                self.with_retry(|| coord.apply_microblocks(stream))?;
            }
            FeedEvent::MempoolSubmit(txs) => {
                self.with_retry(|| coord.submit_mempool_txs(txs))?;
            }
            FeedEvent::MempoolDrop(dropped) => {
                self.with_retry(|| {
                    coord.drop_mempool_txs(
                        &dropped.dropped_txids,
                        dropped.reason,
                        dropped.new_txid,
                    )
                })?;
            }
            FeedEvent::MempoolGc => {
                self.with_retry(|| coord.garbage_collect_mempool())?;
            }
        }
        Ok(())
    }

    /// Feed every line of `reader` into the coordinator, in order.  Rejected events are
    /// logged and counted unless `stop_on_error` is set; I/O errors on the feed always stop.
    pub fn replay<R: BufRead>(
        &self,
        coord: &mut ChainStateCoordinator,
        reader: R,
    ) -> Result<ReplaySummary, Error> {
        let mut summary = ReplaySummary::default();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::InvalidData(format!("failed to read feed: {e}")))?;
            summary.lines += 1;
            let res = FeedEvent::from_line(&line).and_then(|event| match event {
                Some(event) => self.apply(coord, &event, &mut summary).map(|_| true),
                None => Ok(false),
            });
            match res {
                Ok(true) => summary.applied += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.rejected += 1;
                    warn!("Rejected feed event"; "line" => line_no + 1, "err" => %e);
                    if self.stop_on_error {
                        return Err(e);
                    }
                }
            }
        }
        info!("Feed replay finished";
              "lines" => summary.lines,
              "applied" => summary.applied,
              "rejected" => summary.rejected,
              "reorgs" => summary.reorgs);
        Ok(summary)
    }
}
