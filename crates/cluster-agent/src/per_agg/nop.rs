// SPDX-License-Identifier: Apache-2.0

//! The no-op allocator: disables enforcement while still exercising the
//! telemetry path.

use chrono::{DateTime, Utc};
use heyp_flows::AggInfo;
use heyp_proto::FlowAlloc;
use tracing::debug;

use super::{DebugState, PerAggAllocator};

/// Always returns an empty allocation list.
pub struct NopAllocator;

impl PerAggAllocator for NopAllocator {
    fn alloc_agg(
        &self,
        time: DateTime<Utc>,
        _agg_info: &AggInfo,
        _debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc> {
        debug!(%time, "returning empty alloc");
        Vec::new()
    }
}
