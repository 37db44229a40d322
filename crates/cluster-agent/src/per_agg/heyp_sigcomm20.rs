// SPDX-License-Identifier: Apache-2.0

//! The HEYP-Sigcomm20 allocator: HIPRI + LOPRI admission with LOPRI
//! congestion inference.
//!
//! Per FG and per tick it (1) revises the LOPRI admission downward when the
//! measured LOPRI/HIPRI byte ratio falls short of the intended split,
//! (2) computes the LOPRI fraction (optionally raised to probe for latent
//! demand), (3) partitions children with the configured downgrade selector,
//! and (4) waterfills each priority's admission over its children.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use heyp_alg::downgrade::{self, DowngradeSelector, FlowVolumeSource, HostLevelView};
use heyp_alg::fairness::SingleLinkMaxMinFairnessProblem;
use heyp_alg::rate_limits::{bwe_burstiness_factor, evenly_distribute_extra};
use heyp_config::ClusterAllocatorConfig;
use heyp_flows::AggInfo;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::{FlowAlloc, FlowInfo};
use parking_lot::Mutex;
use tracing::info;

use super::{DebugState, PerAggAllocator};

/// Closed-loop state carried across ticks for one FG.
#[derive(Clone, Debug)]
pub struct PerAggState {
    /// The FG's current admission.
    pub alloc: FlowAlloc,
    /// The LOPRI fraction recorded for congestion inference.
    pub frac_lopri: f64,
    /// The LOPRI fraction actually used for selection (>= `frac_lopri` when
    /// probing).
    pub frac_lopri_with_probing: f64,
    /// Time of the last tick.
    pub last_time: DateTime<Utc>,
    /// Cumulative HIPRI bytes at the last tick.
    pub last_cum_hipri_usage_bytes: i64,
    /// Cumulative LOPRI bytes at the last tick.
    pub last_cum_lopri_usage_bytes: i64,
}

impl PerAggState {
    fn new(alloc: FlowAlloc) -> Self {
        Self {
            alloc,
            frac_lopri: 0.0,
            frac_lopri_with_probing: 0.0,
            last_time: DateTime::<Utc>::UNIX_EPOCH,
            last_cum_hipri_usage_bytes: 0,
            last_cum_lopri_usage_bytes: 0,
        }
    }
}

/// Revises the LOPRI admission when the measured LOPRI/HIPRI ratio implies
/// LOPRI congestion. Returns the (possibly lowered) LOPRI rate limit; the
/// limit never increases here.
pub fn maybe_revise_lopri_admission(
    acceptable_measured_ratio_over_intended_ratio: f64,
    time: DateTime<Utc>,
    parent: &FlowInfo,
    cur_state: &PerAggState,
) -> i64 {
    if time <= cur_state.last_time {
        tracing::warn!(
            %time,
            last_time = %cur_state.last_time,
            "cur time needs to be after last time"
        );
        return cur_state.alloc.lopri_rate_limit_bps;
    }
    if cur_state.alloc.hipri_rate_limit_bps <= 0 || cur_state.frac_lopri <= 0.0 {
        return cur_state.alloc.lopri_rate_limit_bps;
    }

    let hipri_usage_bytes =
        (parent.cum_hipri_usage_bytes - cur_state.last_cum_hipri_usage_bytes) as f64;
    let lopri_usage_bytes =
        (parent.cum_lopri_usage_bytes - cur_state.last_cum_lopri_usage_bytes) as f64;

    if hipri_usage_bytes == 0.0 {
        info!(flow = ?parent.flow(), "no HIPRI usage");
        return cur_state.alloc.lopri_rate_limit_bps;
    }

    // If we try to send X bps as LOPRI but only a fraction of it goes
    // through, LOPRI is congested and its limit should come down. Sending
    // MORE than intended only means the demand split was misestimated, so
    // limits are left alone.
    let measured_ratio_over_intended_ratio = lopri_usage_bytes * (1.0 - cur_state.frac_lopri)
        / (hipri_usage_bytes * cur_state.frac_lopri);

    if measured_ratio_over_intended_ratio >= acceptable_measured_ratio_over_intended_ratio {
        return cur_state.alloc.lopri_rate_limit_bps;
    }

    let elapsed = time - cur_state.last_time;
    let secs = elapsed.num_nanoseconds().unwrap_or(i64::MAX) as f64 / 1e9;
    let lopri_usage_bps = 8.0 * lopri_usage_bytes / secs;

    // Rate limiting is not perfect, avoid increasing the LOPRI limit.
    let new_lopri_limit = (lopri_usage_bps as i64).min(cur_state.alloc.lopri_rate_limit_bps);
    info!(
        flow = ?parent.flow(),
        ratio = measured_ratio_over_intended_ratio,
        old_limit = cur_state.alloc.lopri_rate_limit_bps,
        new_limit = new_lopri_limit,
        frac_lopri = cur_state.frac_lopri,
        "inferred LOPRI congestion"
    );
    new_lopri_limit
}

/// See the module docs.
pub struct HeypSigcomm20Allocator {
    config: ClusterAllocatorConfig,
    agg_states: HashMap<ClusterFlowKey, Mutex<AggEntry>>,
}

struct AggEntry {
    state: PerAggState,
    selector: DowngradeSelector,
}

impl HeypSigcomm20Allocator {
    /// Creates the allocator with the given admissions.
    pub fn new(
        config: ClusterAllocatorConfig,
        agg_admissions: HashMap<ClusterFlowKey, FlowAlloc>,
    ) -> Self {
        let agg_states = agg_admissions
            .into_iter()
            .map(|(key, alloc)| {
                (
                    key,
                    Mutex::new(AggEntry {
                        state: PerAggState::new(alloc),
                        selector: DowngradeSelector::new(config.downgrade_selector.clone()),
                    }),
                )
            })
            .collect();
        Self { config, agg_states }
    }
}

impl PerAggAllocator for HeypSigcomm20Allocator {
    fn alloc_agg(
        &self,
        time: DateTime<Utc>,
        agg_info: &AggInfo,
        debug_state: &mut DebugState,
    ) -> Vec<FlowAlloc> {
        let key = ClusterFlowKey::from(agg_info.parent.flow());
        let Some(entry) = self.agg_states.get(&key) else {
            info!(flow = ?agg_info.parent.flow(), "no admission for FG");
            return Vec::new();
        };
        let mut entry = entry.lock();
        let entry = &mut *entry;
        let cur_state = &mut entry.state;

        cur_state.alloc.lopri_rate_limit_bps = maybe_revise_lopri_admission(
            self.config.heyp_acceptable_measured_ratio_over_intended_ratio,
            time,
            &agg_info.parent,
            cur_state,
        );

        cur_state.last_time = time;
        cur_state.last_cum_hipri_usage_bytes = agg_info.parent.cum_hipri_usage_bytes;
        cur_state.last_cum_lopri_usage_bytes = agg_info.parent.cum_lopri_usage_bytes;

        let mut hipri_admission = cur_state.alloc.hipri_rate_limit_bps;
        let mut lopri_admission = cur_state.alloc.lopri_rate_limit_bps;

        debug_state.parent_alloc = cur_state.alloc.clone();

        // The selector measures children by its configured volume source;
        // the admission split below always works on predicted demand.
        let view = HostLevelView::create(
            &agg_info.parent,
            &agg_info.children,
            entry.selector.volume_source(),
        );

        cur_state.frac_lopri = downgrade::frac_admitted_at_lopri(
            &agg_info.parent,
            FlowVolumeSource::PredictedDemand,
            hipri_admission,
            lopri_admission,
        );
        cur_state.frac_lopri_with_probing = if self.config.heyp_probe_lopri_when_ambiguous {
            downgrade::frac_admitted_at_lopri_to_probe(
                &view,
                hipri_admission,
                lopri_admission,
                self.config.demand_multiplier,
                cur_state.frac_lopri,
            )
        } else {
            cur_state.frac_lopri
        };

        debug_state.frac_lopri_initial = cur_state.frac_lopri;
        debug_state.frac_lopri_with_probing = cur_state.frac_lopri_with_probing;

        cur_state.frac_lopri_with_probing =
            downgrade::clamp_frac_lopri(cur_state.frac_lopri_with_probing);

        // Burstiness matters both for selecting children and for their
        // rate limits.
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

        let lopri_children = entry
            .selector
            .pick_lopri_children(&view, cur_state.frac_lopri_with_probing);

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
        if frac_lopri_post_partition < cur_state.frac_lopri {
            // We may not send as much demand using LOPRI as we'd like because
            // the children could not be partitioned in the right proportion.
            // Record the achieved fraction so the next tick's congestion
            // inference does not over-react.
            cur_state.frac_lopri = frac_lopri_post_partition;
        }

        debug_state.frac_lopri_post_partition = frac_lopri_post_partition;
        debug_state.frac_lopri_final = cur_state.frac_lopri;

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

        let hipri_limit =
            (self.config.oversub_factor * (hipri_waterlevel + hipri_bonus) as f64) as i64;
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use heyp_proto::FlowMarker;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn state(frac_lopri: f64, hipri_limit: i64, lopri_limit: i64) -> PerAggState {
        PerAggState {
            alloc: FlowAlloc {
                flow: None,
                hipri_rate_limit_bps: hipri_limit,
                lopri_rate_limit_bps: lopri_limit,
            },
            frac_lopri,
            frac_lopri_with_probing: frac_lopri,
            last_time: DateTime::<Utc>::UNIX_EPOCH,
            last_cum_hipri_usage_bytes: 0,
            last_cum_lopri_usage_bytes: 0,
        }
    }

    fn parent(cum_hipri: i64, cum_lopri: i64) -> FlowInfo {
        FlowInfo {
            flow: Some(FlowMarker {
                src_dc: "x".into(),
                ..Default::default()
            }),
            cum_hipri_usage_bytes: cum_hipri,
            cum_lopri_usage_bytes: cum_lopri,
            ..Default::default()
        }
    }

    #[test]
    fn revise_lopri_admission_basic() {
        // Ratio right on target: no change.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(900, 300), &state(0.25, 7200, 7200)),
            7200
        );
        // Slightly under intended, still above threshold: no change.
        assert_eq!(
            maybe_revise_lopri_admission(0.9, t(1), &parent(900, 271), &state(0.25, 7200, 7200)),
            7200
        );
        // Below threshold: limit drops to the measured LOPRI rate.
        assert_eq!(
            maybe_revise_lopri_admission(0.9, t(1), &parent(900, 269), &state(0.25, 7200, 7200)),
            2152
        );
    }

    #[test]
    fn revise_lopri_admission_edge_cases() {
        // All LOPRI: no HIPRI admission, nothing to infer.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(10, 500), &state(1.0, 0, 7200)),
            7200
        );
        // All HIPRI: frac_lopri = 0, nothing to infer.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(900, 10), &state(0.0, 7200, 0)),
            0
        );
        // Zero usage: nothing to infer.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(0, 0), &state(1.0, 7200, 7200)),
            7200
        );
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(10, 500), &state(0.0, 0, 0)),
            0
        );
        // HIPRI saw nothing at all: bail out rather than divide by zero.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(0, 300), &state(0.0, 7200, 7200)),
            7200
        );
        // LOPRI completely failed.
        assert_eq!(
            maybe_revise_lopri_admission(1.0, t(1), &parent(900, 0), &state(0.5, 7200, 7200)),
            0
        );
    }

    fn fg_marker() -> FlowMarker {
        FlowMarker {
            src_dc: "chicago".into(),
            dst_dc: "detroit".into(),
            ..Default::default()
        }
    }

    fn child(host_id: u64, demand: i64, currently_lopri: bool) -> FlowInfo {
        FlowInfo {
            flow: Some(FlowMarker {
                src_dc: "chicago".into(),
                dst_dc: "detroit".into(),
                host_id,
                ..Default::default()
            }),
            predicted_demand_bps: demand,
            currently_lopri,
            ..Default::default()
        }
    }

    #[test]
    fn splits_children_across_priorities() {
        let admissions = {
            let mut m = HashMap::new();
            let _ = m.insert(
                ClusterFlowKey::from(&fg_marker()),
                FlowAlloc {
                    flow: Some(fg_marker()),
                    hipri_rate_limit_bps: 600,
                    lopri_rate_limit_bps: 400,
                },
            );
            m
        };
        let alloc = HeypSigcomm20Allocator::new(ClusterAllocatorConfig::default(), admissions);

        let agg_info = AggInfo {
            parent: FlowInfo {
                flow: Some(fg_marker()),
                predicted_demand_bps: 1000,
                ..Default::default()
            },
            children: vec![child(1, 600, false), child(2, 400, false)],
        };

        let mut debug_state = DebugState::default();
        let allocs = alloc.alloc_agg(t(1), &agg_info, &mut debug_state);
        assert_eq!(allocs.len(), 2);
        // frac_lopri = min((1000-600)/1000, 400/1000) = 0.4; the greedy
        // selector moves host 2 (demand 400 = target) to LOPRI.
        assert!(debug_state.frac_lopri_initial > 0.39 && debug_state.frac_lopri_initial < 0.41);
        let by_host: HashMap<u64, &FlowAlloc> =
            allocs.iter().map(|a| (a.flow().host_id, a)).collect();
        assert_eq!(by_host[&1].lopri_rate_limit_bps, 0);
        assert!(by_host[&1].hipri_rate_limit_bps > 0);
        assert_eq!(by_host[&2].hipri_rate_limit_bps, 0);
        assert!(by_host[&2].lopri_rate_limit_bps > 0);
    }
}
