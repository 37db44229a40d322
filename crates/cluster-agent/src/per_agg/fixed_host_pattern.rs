// SPDX-License-Identifier: Apache-2.0

//! The fixed-host-pattern allocator: replays a per-FG cyclic list of
//! scripted snapshots. Used by integration tests to inject known-good
//! allocation sequences.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use heyp_config::{ClusterAllocatorConfig, FixedClusterHostAllocs, FixedHostAllocSnapshot};
use heyp_flows::AggInfo;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::FlowAlloc;
use tracing::info;

use super::{DebugState, PerAggAllocator};

struct SnapshotHostIter<'a> {
    snapshot: &'a FixedHostAllocSnapshot,
    pair_index: usize,
    pair_remaining: u64,
}

impl<'a> SnapshotHostIter<'a> {
    fn new(snapshot: &'a FixedHostAllocSnapshot) -> Self {
        let pair_remaining = snapshot.host_allocs.first().map_or(0, |p| p.num_hosts);
        Self {
            snapshot,
            pair_index: 0,
            pair_remaining,
        }
    }

    fn next(&mut self) -> (i64, i64) {
        while self.pair_index < self.snapshot.host_allocs.len() {
            if self.pair_remaining > 0 {
                self.pair_remaining -= 1;
                let pair = &self.snapshot.host_allocs[self.pair_index];
                return (pair.hipri_rate_limit_bps, pair.lopri_rate_limit_bps);
            }
            self.pair_index += 1;
            if self.pair_index < self.snapshot.host_allocs.len() {
                self.pair_remaining = self.snapshot.host_allocs[self.pair_index].num_hosts;
            }
        }
        (0, 0)
    }
}

/// See the module docs.
pub struct FixedHostPatternAllocator {
    alloc_patterns: HashMap<ClusterFlowKey, FixedClusterHostAllocs>,
    next: AtomicUsize,
}

impl FixedHostPatternAllocator {
    /// Creates the allocator from the configured patterns.
    pub fn new(config: &ClusterAllocatorConfig) -> Self {
        let alloc_patterns = config
            .fixed_host_alloc_patterns
            .iter()
            .map(|p| {
                (
                    ClusterFlowKey {
                        src_dc: p.src_dc.clone(),
                        dst_dc: p.dst_dc.clone(),
                    },
                    p.clone(),
                )
            })
            .collect();
        Self {
            alloc_patterns,
            next: AtomicUsize::new(0),
        }
    }
}

impl PerAggAllocator for FixedHostPatternAllocator {
    fn alloc_agg(
        &self,
        time: DateTime<Utc>,
        agg_info: &AggInfo,
        _debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc> {
        let key = ClusterFlowKey::from(agg_info.parent.flow());
        let Some(pattern) = self.alloc_patterns.get(&key) else {
            info!(flow = ?agg_info.parent.flow(), "no admission for FG");
            return Vec::new();
        };
        if pattern.snapshots.is_empty() {
            return Vec::new();
        }

        let step = self.next.fetch_add(1, Ordering::SeqCst);
        info!(%time, step, "allocating from fixed pattern");
        let snapshot = &pattern.snapshots[step % pattern.snapshots.len()];

        let mut iter = SnapshotHostIter::new(snapshot);
        agg_info
            .children
            .iter()
            .map(|child| {
                let (hipri, lopri) = iter.next();
                FlowAlloc {
                    flow: child.flow.clone(),
                    hipri_rate_limit_bps: hipri,
                    lopri_rate_limit_bps: lopri,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_config::FixedHostAlloc;
    use heyp_proto::{FlowInfo, FlowMarker};

    fn fg_marker() -> FlowMarker {
        FlowMarker {
            src_dc: "chicago".into(),
            dst_dc: "detroit".into(),
            ..Default::default()
        }
    }

    fn agg(n_children: u64) -> AggInfo {
        AggInfo {
            parent: FlowInfo {
                flow: Some(fg_marker()),
                ..Default::default()
            },
            children: (1..=n_children)
                .map(|host_id| FlowInfo {
                    flow: Some(FlowMarker {
                        src_dc: "chicago".into(),
                        dst_dc: "detroit".into(),
                        host_id,
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn cycles_through_snapshots() {
        let config = ClusterAllocatorConfig {
            allocator_type: heyp_config::ClusterAllocatorType::FixedHostPattern,
            fixed_host_alloc_patterns: vec![FixedClusterHostAllocs {
                src_dc: "chicago".into(),
                dst_dc: "detroit".into(),
                snapshots: vec![
                    FixedHostAllocSnapshot {
                        host_allocs: vec![
                            FixedHostAlloc {
                                num_hosts: 2,
                                hipri_rate_limit_bps: 100,
                                lopri_rate_limit_bps: 0,
                            },
                            FixedHostAlloc {
                                num_hosts: 1,
                                hipri_rate_limit_bps: 0,
                                lopri_rate_limit_bps: 50,
                            },
                        ],
                    },
                    FixedHostAllocSnapshot {
                        host_allocs: vec![FixedHostAlloc {
                            num_hosts: 3,
                            hipri_rate_limit_bps: 77,
                            lopri_rate_limit_bps: 0,
                        }],
                    },
                ],
            }],
            ..Default::default()
        };
        let alloc = FixedHostPatternAllocator::new(&config);
        let mut debug_state = DebugState::default();

        let first = alloc.alloc_agg(Utc::now(), &agg(4), &mut debug_state);
        assert_eq!(
            first
                .iter()
                .map(|a| (a.hipri_rate_limit_bps, a.lopri_rate_limit_bps))
                .collect::<Vec<_>>(),
            vec![(100, 0), (100, 0), (0, 50), (0, 0)]
        );

        let second = alloc.alloc_agg(Utc::now(), &agg(2), &mut debug_state);
        assert_eq!(
            second
                .iter()
                .map(|a| (a.hipri_rate_limit_bps, a.lopri_rate_limit_bps))
                .collect::<Vec<_>>(),
            vec![(77, 0), (77, 0)]
        );
    }
}
