// SPDX-License-Identifier: Apache-2.0

//! Per-FG allocators.
//!
//! Each allocator consumes one aggregate snapshot per tick and produces the
//! per-child [`FlowAlloc`]s for that FG. Allocators keep their own per-FG
//! state; missing admissions for an FG yield an empty allocation (logged at
//! info level, not an error).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heyp_config::{ClusterAllocatorConfig, ClusterAllocatorType};
use heyp_flows::AggInfo;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::{AllocBundle, FlowAlloc};
use serde::Serialize;

pub mod bwe;
pub mod fixed_host_pattern;
pub mod heyp_sigcomm20;
pub mod nop;
pub mod simple_downgrade;

/// Sentinel rate for "effectively unlimited": 100 Gbps.
pub const MAX_CHILD_BANDWIDTH_BPS: i64 = 100 * (1i64 << 30);

/// Internal allocator state captured for the NDJSON debug log.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DebugState {
    /// The FG-level admission used.
    pub parent_alloc: FlowAlloc,
    /// Burstiness factor applied to the admissions.
    pub burstiness: f64,
    /// Evenly distributed HIPRI bonus.
    pub hipri_bonus: i64,
    /// Evenly distributed LOPRI bonus.
    pub lopri_bonus: i64,
    /// LOPRI fraction before probing.
    pub frac_lopri_initial: f64,
    /// LOPRI fraction after probing.
    pub frac_lopri_with_probing: f64,
    /// Achieved LOPRI fraction after partitioning children.
    pub frac_lopri_post_partition: f64,
    /// LOPRI fraction recorded for the next tick.
    pub frac_lopri_final: f64,
}

/// A per-FG allocator. Implementations are called concurrently for
/// different FGs and serialize their own per-FG state internally.
pub trait PerAggAllocator: Send + Sync {
    /// Computes this FG's allocations for one tick.
    fn alloc_agg(
        &self,
        time: DateTime<Utc>,
        agg_info: &AggInfo,
        debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc>;
}

/// Indexes cluster-wide admissions by FG.
pub fn to_admissions_map(
    cluster_wide_allocs: &AllocBundle,
) -> HashMap<ClusterFlowKey, FlowAlloc> {
    let mut map = HashMap::new();
    for a in &cluster_wide_allocs.flow_allocs {
        let _ = map.insert(ClusterFlowKey::from(a.flow()), a.clone());
    }
    map
}

/// Instantiates the allocator selected by `config`.
pub fn create_allocator(
    config: &ClusterAllocatorConfig,
    cluster_wide_allocs: &AllocBundle,
) -> Arc<dyn PerAggAllocator> {
    let admissions = to_admissions_map(cluster_wide_allocs);
    match config.allocator_type {
        ClusterAllocatorType::Nop => Arc::new(nop::NopAllocator),
        ClusterAllocatorType::Bwe => Arc::new(bwe::BweAggAllocator::new(config.clone(), admissions)),
        ClusterAllocatorType::HeypSigcomm20 => Arc::new(
            heyp_sigcomm20::HeypSigcomm20Allocator::new(config.clone(), admissions),
        ),
        ClusterAllocatorType::SimpleDowngrade => Arc::new(
            simple_downgrade::SimpleDowngradeAllocator::new(config.clone(), admissions),
        ),
        ClusterAllocatorType::FixedHostPattern => {
            Arc::new(fixed_host_pattern::FixedHostPatternAllocator::new(config))
        }
    }
}
