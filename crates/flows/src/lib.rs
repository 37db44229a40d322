// SPDX-License-Identifier: Apache-2.0

//! Flow state tracking and aggregation.
//!
//! [`state`] maintains the per-flow measurement state (EWMA usage, usage
//! history, predicted demand). [`aggregator`] rolls up flow infos reported
//! by bundlers into per-aggregate snapshots. [`dc_mapper`] maps host
//! addresses to datacenters.

pub mod aggregator;
pub mod dc_mapper;
pub mod state;

pub use aggregator::{AggInfo, FlowAggregator};
pub use dc_mapper::StaticDCMapper;
pub use state::{AggState, AggUpdate, LeafState, LeafUpdate};
