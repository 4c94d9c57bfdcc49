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

use std::sync::LazyLock;

use prometheus::{
    histogram_opts, opts, register_histogram, register_int_counter, register_int_gauge,
    Encoder, Histogram, IntCounter, IntGauge, TextEncoder,
};

pub static STX_BLOCKS_RECEIVED_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_stx_blocks_received_total",
        "Total number of anchored blocks ingested"
    ))
    .expect("Failed to register STX_BLOCKS_RECEIVED_COUNTER")
});

pub static STX_MICRO_BLOCKS_RECEIVED_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_stx_micro_blocks_received_total",
        "Total number of unconfirmed microblocks ingested"
    ))
    .expect("Failed to register STX_MICRO_BLOCKS_RECEIVED_COUNTER")
});

pub static REJECTED_INPUTS_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_rejected_inputs_total",
        "Total number of blocks or microblock batches rejected"
    ))
    .expect("Failed to register REJECTED_INPUTS_COUNTER")
});

pub static REORGS_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_reorgs_total",
        "Total number of canonical chain reorganizations"
    ))
    .expect("Failed to register REORGS_COUNTER")
});

pub static REORG_DEPTH_HISTOGRAM: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(histogram_opts!(
        "stacks_indexer_reorg_depth",
        "Number of canonical blocks rolled back per reorganization",
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 25.0, 100.0]
    ))
    .expect("Failed to register REORG_DEPTH_HISTOGRAM")
});

pub static MEMPOOL_TXS_ADMITTED_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_mempool_txs_admitted_total",
        "Total number of transactions that entered the mempool, including revived ones"
    ))
    .expect("Failed to register MEMPOOL_TXS_ADMITTED_COUNTER")
});

pub static MEMPOOL_TXS_DROPPED_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_mempool_txs_dropped_total",
        "Total number of mempool transactions dropped"
    ))
    .expect("Failed to register MEMPOOL_TXS_DROPPED_COUNTER")
});

pub static MEMPOOL_GC_COUNTER: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "stacks_indexer_mempool_gc_runs_total",
        "Total number of mempool garbage-collection passes"
    ))
    .expect("Failed to register MEMPOOL_GC_COUNTER")
});

pub static STACKS_TIP_HEIGHT_GAUGE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(opts!(
        "stacks_indexer_stacks_tip_height",
        "Height of the canonical chain tip"
    ))
    .expect("Failed to register STACKS_TIP_HEIGHT_GAUGE")
});

pub static MEMPOOL_SIZE_GAUGE: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(opts!(
        "stacks_indexer_mempool_size",
        "Number of pending mempool transactions"
    ))
    .expect("Failed to register MEMPOOL_SIZE_GAUGE")
});

pub fn gather_text() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!("Failed to encode metrics"; "error" => %e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
