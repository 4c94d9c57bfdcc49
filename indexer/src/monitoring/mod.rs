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

#[cfg(feature = "monitoring_prom")]
mod prometheus;

pub fn increment_stx_blocks_received_counter() {
    #[cfg(feature = "monitoring_prom")]
    prometheus::STX_BLOCKS_RECEIVED_COUNTER.inc();
}

pub fn increment_stx_micro_blocks_received_counter() {
    #[cfg(feature = "monitoring_prom")]
    prometheus::STX_MICRO_BLOCKS_RECEIVED_COUNTER.inc();
}

pub fn increment_rejected_inputs_counter() {
    #[cfg(feature = "monitoring_prom")]
    prometheus::REJECTED_INPUTS_COUNTER.inc();
}

/// A reorg rolled back `depth` canonical blocks
#[allow(unused_variables)]
pub fn record_reorg(depth: u64) {
    #[cfg(feature = "monitoring_prom")]
    {
        prometheus::REORGS_COUNTER.inc();
        prometheus::REORG_DEPTH_HISTOGRAM.observe(depth as f64);
    }
}

#[allow(unused_variables)]
pub fn increment_mempool_txs_admitted(count: u64) {
    #[cfg(feature = "monitoring_prom")]
    prometheus::MEMPOOL_TXS_ADMITTED_COUNTER.inc_by(count);
}

#[allow(unused_variables)]
pub fn increment_mempool_txs_dropped(count: u64) {
    #[cfg(feature = "monitoring_prom")]
    prometheus::MEMPOOL_TXS_DROPPED_COUNTER.inc_by(count);
}

pub fn increment_mempool_gc() {
    #[cfg(feature = "monitoring_prom")]
    prometheus::MEMPOOL_GC_COUNTER.inc();
}

#[allow(unused_variables)]
pub fn update_stacks_tip_height(value: i64) {
    #[cfg(feature = "monitoring_prom")]
    prometheus::STACKS_TIP_HEIGHT_GAUGE.set(value);
}

#[allow(unused_variables)]
pub fn update_mempool_size(value: i64) {
    #[cfg(feature = "monitoring_prom")]
    prometheus::MEMPOOL_SIZE_GAUGE.set(value);
}

/// Render every registered metric in the Prometheus text format.
/// Empty if built without the `monitoring_prom` feature.
pub fn gather_metrics() -> String {
    #[cfg(feature = "monitoring_prom")]
    {
        prometheus::gather_text()
    }
    #[cfg(not(feature = "monitoring_prom"))]
    {
        String::new()
    }
}
