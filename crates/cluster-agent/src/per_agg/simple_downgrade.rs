// SPDX-License-Identifier: Apache-2.0

//! The simple-downgrade allocator: like HEYP-Sigcomm20 but with no
//! congestion inference and no probing. HIPRI is throttled only under the
//! configured condition; otherwise it receives the unlimited sentinel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use heyp_alg::downgrade::{self, DowngradeSelector, HostLevelView};
use heyp_alg::fairness::SingleLinkMaxMinFairnessProblem;
use heyp_alg::rate_limits::{bwe_burstiness_factor, evenly_distribute_extra};
use heyp_config::{ClusterAllocatorConfig, HipriThrottleCondition};
use heyp_flows::AggInfo;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::FlowAlloc;
use parking_lot::Mutex;
use tracing::info;

use super::{DebugState, PerAggAllocator, MAX_CHILD_BANDWIDTH_BPS};

/// See the module docs.
pub struct SimpleDowngradeAllocator {
    config: ClusterAllocatorConfig,
    agg_admissions: HashMap<ClusterFlowKey, FlowAlloc>,
    selectors: HashMap<ClusterFlowKey, Mutex<DowngradeSelector>>,
}

impl SimpleDowngradeAllocator {
    /// Creates the allocator with the given admissions.
    pub fn new(
        config: ClusterAllocatorConfig,
        agg_admissions: HashMap<ClusterFlowKey, FlowAlloc>,
    ) -> Self {
        let selectors = agg_admissions
            .keys()
            .map(|key| {
                (
                    key.clone(),
                    Mutex::new(DowngradeSelector::new(config.downgrade_selector.clone())),
                )
            })
            .collect();
        Self {
            config,
            agg_admissions,
            selectors,
        }
    }
}

impl PerAggAllocator for SimpleDowngradeAllocator {
    fn alloc_agg(
        &self,
        _time: DateTime<Utc>,
        agg_info: &AggInfo,
        debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc> {
        let key = ClusterFlowKey::from(agg_info.parent.flow());
        let Some(admissions) = self.agg_admissions.get(&key) else {
            info!(flow = ?agg_info.parent.flow(), "no admission for FG");
            return Vec::new();
        };
        let mut selector = self.selectors[&key].lock();
        let volume_source = selector.volume_source();

        let mut hipri_admission = admissions.hipri_rate_limit_bps;
        let mut lopri_admission = admissions.lopri_rate_limit_bps;

        let parent_volume = downgrade::flow_volume(&agg_info.parent, volume_source);
        let lopri_bps = (parent_volume - hipri_admission).max(0);
        let mut frac_lopri = lopri_bps as f64 / parent_volume as f64;

        debug_state.parent_alloc = admissions.clone();
        debug_state.frac_lopri_initial = frac_lopri;
        debug_state.frac_lopri_with_probing = frac_lopri;

        frac_lopri = downgrade::clamp_frac_lopri(frac_lopri);

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
            hipri_admission = (hipri_admission as f64 * burstiness) as i64;
            lopri_admission = (lopri_admission as f64 * burstiness) as i64;
            debug_state.burstiness = burstiness;
        } else {
            debug_state.burstiness = 1.0;
        }

        let view = HostLevelView::create(&agg_info.parent, &agg_info.children, volume_source);
        let lopri_children = if frac_lopri > 0.0 {
            selector.pick_lopri_children(&view, frac_lopri)
        } else {
            vec![false; agg_info.children.len()]
        };

        let mut hipri_demands = Vec::with_capacity(agg_info.children.len());
        let mut lopri_demands = Vec::with_capacity(agg_info.children.len());
        let mut sum_hipri_demand = 0.0;
        let mut sum_lopri_demand = 0.0;
        for (child, &is_lopri) in agg_info.children.iter().zip(&lopri_children) {
            if is_lopri {
                lopri_demands.push(child.predicted_demand_bps);
                sum_lopri_demand += child.predicted_demand_bps as f64;
            } else {
                hipri_demands.push(child.predicted_demand_bps);
                sum_hipri_demand += child.predicted_demand_bps as f64;
            }
        }

        let frac_lopri_post_partition = sum_lopri_demand / (sum_hipri_demand + sum_lopri_demand);
        debug_state.frac_lopri_post_partition = frac_lopri_post_partition;
        debug_state.frac_lopri_final = frac_lopri.min(frac_lopri_post_partition);

        let mut problem = SingleLinkMaxMinFairnessProblem::new();
        let hipri_waterlevel = problem.compute_waterlevel(hipri_admission, &hipri_demands);
        let lopri_waterlevel = problem.compute_waterlevel(lopri_admission, &lopri_demands);

        let (hipri_bonus, lopri_bonus) = if self.config.enable_bonus {
            (
                evenly_distribute_extra(hipri_admission, &hipri_demands, hipri_waterlevel),
                evenly_distribute_extra(lopri_admission, &lopri_demands, lopri_waterlevel),
            )
        } else {
            (0, 0)
        };
        debug_state.hipri_bonus = hipri_bonus;
        debug_state.lopri_bonus = lopri_bonus;

        let throttle_hipri = match self.config.simple_downgrade_throttle_hipri {
            HipriThrottleCondition::Never => false,
            HipriThrottleCondition::WhenAboveHipriLimit => lopri_bps > 0,
            HipriThrottleCondition::WhenAssignedLopri => !lopri_demands.is_empty(),
            HipriThrottleCondition::Always => true,
        };

        let mut hipri_limit =
            (self.config.oversub_factor * (hipri_waterlevel + hipri_bonus) as f64) as i64;
        if !throttle_hipri {
            hipri_limit = MAX_CHILD_BANDWIDTH_BPS;
        }
        let lopri_limit =
            (self.config.oversub_factor * (lopri_waterlevel + lopri_bonus) as f64) as i64;

        agg_info
            .children
            .iter()
            .zip(&lopri_children)
            .map(|(child, &is_lopri)| {
                let mut alloc = FlowAlloc {
                    flow: child.flow.clone(),
                    hipri_rate_limit_bps: 0,
                    lopri_rate_limit_bps: 0,
                };
                if is_lopri {
                    alloc.lopri_rate_limit_bps = lopri_limit;
                } else {
                    alloc.hipri_rate_limit_bps = hipri_limit;
                }
                alloc
            })
            .collect()
    }
}
