// SPDX-License-Identifier: Apache-2.0

//! The BwE-style allocator: HIPRI-only waterfill of the FG admission across
//! child demands.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use heyp_alg::fairness::SingleLinkMaxMinFairnessProblem;
use heyp_alg::rate_limits::{bwe_burstiness_factor, evenly_distribute_extra};
use heyp_config::ClusterAllocatorConfig;
use heyp_flows::AggInfo;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::FlowAlloc;
use tracing::info;

use super::{DebugState, PerAggAllocator};

/// See the module docs.
pub struct BweAggAllocator {
    config: ClusterAllocatorConfig,
    agg_admissions: HashMap<ClusterFlowKey, FlowAlloc>,
}

impl BweAggAllocator {
    /// Creates the allocator with the given admissions.
    pub fn new(
        config: ClusterAllocatorConfig,
        agg_admissions: HashMap<ClusterFlowKey, FlowAlloc>,
    ) -> Self {
        Self {
            config,
            agg_admissions,
        }
    }
}

impl PerAggAllocator for BweAggAllocator {
    fn alloc_agg(
        &self,
        _time: DateTime<Utc>,
        agg_info: &AggInfo,
        debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc> {
        let key = ClusterFlowKey::from(agg_info.parent.flow());
        let Some(admission) = self.agg_admissions.get(&key) else {
            info!(flow = ?agg_info.parent.flow(), "no admission for FG");
            return Vec::new();
        };

        debug_assert_eq!(
            admission.lopri_rate_limit_bps, 0,
            "BwE allocation is incompatible with QoS downgrade"
        );
        let mut cluster_admission = admission.hipri_rate_limit_bps;

        debug_state.parent_alloc = admission.clone();

        if self.config.enable_burstiness {
            let sum_child_demand: f64 = agg_info
                .children
                .iter()
                .map(|c| c.predicted_demand_bps as f64)
                .sum();
            let burstiness = bwe_burstiness_factor(
                agg_info.parent.predicted_demand_bps as f64,
                sum_child_demand,
            );
            cluster_admission = (cluster_admission as f64 * burstiness) as i64;
            debug_state.burstiness = burstiness;
        } else {
            debug_state.burstiness = 1.0;
        }

        let demands: Vec<i64> = agg_info
            .children
            .iter()
            .map(|c| c.predicted_demand_bps)
            .collect();

        let mut problem = SingleLinkMaxMinFairnessProblem::new();
        let waterlevel = problem.compute_waterlevel(cluster_admission, &demands);

        let bonus = if self.config.enable_bonus {
            evenly_distribute_extra(cluster_admission, &demands, waterlevel)
        } else {
            0
        };
        debug_state.hipri_bonus = bonus;

        let limit = (self.config.oversub_factor * (waterlevel + bonus) as f64) as i64;

        agg_info
            .children
            .iter()
            .map(|child| FlowAlloc {
                flow: child.flow.clone(),
                hipri_rate_limit_bps: limit,
                lopri_rate_limit_bps: 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_proto::{AllocBundle, FlowInfo, FlowMarker};

    fn fg_marker() -> FlowMarker {
        FlowMarker {
            src_dc: "chicago".into(),
            dst_dc: "detroit".into(),
            ..Default::default()
        }
    }

    fn child(host_id: u64, demand: i64) -> FlowInfo {
        FlowInfo {
            flow: Some(FlowMarker {
                src_dc: "chicago".into(),
                dst_dc: "detroit".into(),
                host_id,
                ..Default::default()
            }),
            predicted_demand_bps: demand,
            ..Default::default()
        }
    }

    fn admissions(hipri: i64) -> AllocBundle {
        AllocBundle {
            flow_allocs: vec![FlowAlloc {
                flow: Some(fg_marker()),
                hipri_rate_limit_bps: hipri,
                lopri_rate_limit_bps: 0,
            }],
            gen: 0,
        }
    }

    #[test]
    fn waterfills_admission() {
        // Admission 666,666 across demands {600000, 60000, 6000, 600, 67}:
        // the waterlevel lands at 599,999 and every child gets it.
        let config = ClusterAllocatorConfig {
            allocator_type: heyp_config::ClusterAllocatorType::Bwe,
            enable_burstiness: false,
            enable_bonus: false,
            oversub_factor: 1.0,
            ..Default::default()
        };
        let alloc = BweAggAllocator::new(
            config,
            super::super::to_admissions_map(&admissions(666_666)),
        );

        let agg_info = AggInfo {
            parent: FlowInfo {
                flow: Some(fg_marker()),
                predicted_demand_bps: 666_667,
                ..Default::default()
            },
            children: vec![
                child(1, 600_000),
                child(2, 60_000),
                child(3, 6_000),
                child(4, 600),
                child(5, 67),
            ],
        };

        let mut debug_state = DebugState::default();
        let allocs = alloc.alloc_agg(Utc::now(), &agg_info, &mut debug_state);
        assert_eq!(allocs.len(), 5);
        for a in &allocs {
            assert_eq!(a.hipri_rate_limit_bps, 599_999);
            assert_eq!(a.lopri_rate_limit_bps, 0);
        }
    }

    #[test]
    fn missing_admission_yields_empty_alloc() {
        let alloc = BweAggAllocator::new(
            ClusterAllocatorConfig::default(),
            super::super::to_admissions_map(&AllocBundle::default()),
        );
        let agg_info = AggInfo {
            parent: FlowInfo {
                flow: Some(fg_marker()),
                ..Default::default()
            },
            children: vec![child(1, 100)],
        };
        let mut debug_state = DebugState::default();
        assert!(alloc.alloc_agg(Utc::now(), &agg_info, &mut debug_state).is_empty());
    }
}
