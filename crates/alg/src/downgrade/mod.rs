// SPDX-License-Identifier: Apache-2.0

//! Downgrade selection: picking which children of an aggregate should use
//! LOPRI so that the LOPRI share of demand lands close to a target fraction.
//!
//! Four selector variants are provided: greedy gap-minimization
//! ([`heyp_sigcomm20`]), [`largest_first`], [`knapsack`], and a consistent
//! hash ring ([`hashing`]) whose picks are sticky across fraction changes.

use heyp_proto::FlowInfo;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub mod hashing;
pub mod heyp_sigcomm20;
pub mod knapsack;
pub mod largest_first;

pub use hashing::{DowngradeDiff, HashingDowngradeSelector, IdRange, UnorderedIds};

/// Which measurement of a flow acts as its "volume" during selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowVolumeSource {
    /// Use the predicted demand.
    #[default]
    PredictedDemand,
    /// Use the measured EWMA usage.
    Usage,
}

/// Returns the selected volume measurement for `info`.
pub fn flow_volume(info: &FlowInfo, source: FlowVolumeSource) -> i64 {
    match source {
        FlowVolumeSource::PredictedDemand => info.predicted_demand_bps,
        FlowVolumeSource::Usage => info.ewma_usage_bps,
    }
}

/// The per-child data selectors operate on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildFlowInfo {
    /// Stable child identifier (the host id).
    pub child_id: u64,
    /// Job the child belongs to; may be empty.
    pub job: String,
    /// Selected volume measurement in bps.
    pub volume_bps: i64,
    /// Whether the child currently uses LOPRI.
    pub currently_lopri: bool,
}

/// A view of one aggregate: the parent measurement plus per-child info.
pub trait AggInfoView {
    /// The aggregate-level measurement.
    fn parent(&self) -> &FlowInfo;
    /// Per-child info, in a stable order.
    fn children(&self) -> &[ChildFlowInfo];
}

/// An [`AggInfoView`] over host-level `FlowInfo`s.
#[derive(Debug)]
pub struct HostLevelView<'a> {
    parent: &'a FlowInfo,
    children: Vec<ChildFlowInfo>,
}

impl<'a> HostLevelView<'a> {
    /// Builds a view, measuring each child with `source`.
    pub fn create(
        parent: &'a FlowInfo,
        children: &[FlowInfo],
        source: FlowVolumeSource,
    ) -> Self {
        let children = children
            .iter()
            .map(|c| ChildFlowInfo {
                child_id: c.flow().host_id,
                job: c.flow().job.clone(),
                volume_bps: flow_volume(c, source),
                currently_lopri: c.currently_lopri,
            })
            .collect();
        Self { parent, children }
    }
}

impl AggInfoView for HostLevelView<'_> {
    fn parent(&self) -> &FlowInfo {
        self.parent
    }

    fn children(&self) -> &[ChildFlowInfo] {
        &self.children
    }
}

/// The selector variants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradeSelectorType {
    /// Greedy bin-packing that minimizes the gap to the target LOPRI demand.
    #[default]
    HeypSigcomm20,
    /// Downgrade the largest children first.
    LargestFirst,
    /// Pick the subset whose volume best approximates the target.
    KnapsackSolver,
    /// Consistent-hash ring with sticky membership.
    Hashing,
}

/// Configuration of a [`DowngradeSelector`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DowngradeSelectorConfig {
    /// Selector variant.
    #[serde(rename = "type")]
    pub selector_type: DowngradeSelectorType,
    /// Aggregate children by job and downgrade whole jobs together.
    pub downgrade_jobs: bool,
    /// Measure children by observed usage instead of predicted demand.
    pub downgrade_usage: bool,
}

/// Dispatches to the configured selector variant.
///
/// Stateful only for the hashing variant (the ring's arc position must
/// persist across calls to provide FIFO upgrades/downgrades).
#[derive(Debug)]
pub struct DowngradeSelector {
    config: DowngradeSelectorConfig,
    hashing: HashingDowngradeSelector,
}

impl DowngradeSelector {
    /// Creates a selector from its configuration.
    pub fn new(config: DowngradeSelectorConfig) -> Self {
        Self {
            config,
            hashing: HashingDowngradeSelector::default(),
        }
    }

    /// The measurement source implied by the configuration.
    pub fn volume_source(&self) -> FlowVolumeSource {
        if self.config.downgrade_usage {
            FlowVolumeSource::Usage
        } else {
            FlowVolumeSource::PredictedDemand
        }
    }

    /// Returns a bitmap marking the children that should use LOPRI. The
    /// marked volume aims to be close to `want_frac_lopri` of the total.
    pub fn pick_lopri_children(
        &mut self,
        view: &dyn AggInfoView,
        want_frac_lopri: f64,
    ) -> Vec<bool> {
        if self.config.downgrade_jobs {
            return self.pick_lopri_jobs(view.children(), want_frac_lopri);
        }
        self.pick_from_children(view.children(), want_frac_lopri)
    }

    fn pick_from_children(&mut self, children: &[ChildFlowInfo], want_frac_lopri: f64) -> Vec<bool> {
        match self.config.selector_type {
            DowngradeSelectorType::HeypSigcomm20 => {
                heyp_sigcomm20::pick_lopri_children(children, want_frac_lopri)
            }
            DowngradeSelectorType::LargestFirst => {
                largest_first::pick_lopri_children(children, want_frac_lopri)
            }
            DowngradeSelectorType::KnapsackSolver => {
                knapsack::pick_lopri_children(children, want_frac_lopri)
            }
            DowngradeSelectorType::Hashing => {
                self.hashing.pick_lopri_children(children, want_frac_lopri)
            }
        }
    }

    fn pick_lopri_jobs(&mut self, children: &[ChildFlowInfo], want_frac_lopri: f64) -> Vec<bool> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut jobs: Vec<ChildFlowInfo> = Vec::new();
        let mut job_index: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        let mut child_job: Vec<usize> = Vec::with_capacity(children.len());
        for child in children {
            let idx = *job_index.entry(child.job.as_str()).or_insert_with(|| {
                let mut hasher = DefaultHasher::new();
                child.job.hash(&mut hasher);
                jobs.push(ChildFlowInfo {
                    child_id: hasher.finish(),
                    job: child.job.clone(),
                    volume_bps: 0,
                    currently_lopri: true,
                });
                jobs.len() - 1
            });
            jobs[idx].volume_bps += child.volume_bps;
            // A job counts as LOPRI only when every member does.
            jobs[idx].currently_lopri &= child.currently_lopri;
            child_job.push(idx);
        }

        let job_lopri = self.pick_from_children(&jobs, want_frac_lopri);
        child_job.into_iter().map(|idx| job_lopri[idx]).collect()
    }
}

/// Clamps a LOPRI fraction to `[0, 1]`, logging when a clamp fires.
/// NaN clamps to 0.
pub fn clamp_frac_lopri(frac_lopri: f64) -> f64 {
    // The double-negative form also catches NaN.
    if !(frac_lopri >= 0.0) {
        warn!(frac_lopri, "frac_lopri < 0; clamping to 0");
        return 0.0;
    }
    if !(frac_lopri <= 1.0) {
        warn!(frac_lopri, "frac_lopri > 1; clamping to 1");
        return 1.0;
    }
    frac_lopri
}

/// [`clamp_frac_lopri`] without the log line, for hot paths.
pub fn clamp_frac_lopri_silent(frac_lopri: f64) -> f64 {
    if !(frac_lopri >= 0.0) {
        return 0.0;
    }
    if !(frac_lopri <= 1.0) {
        return 1.0;
    }
    frac_lopri
}

/// The fraction of the parent's traffic that should ideally be sent at
/// LOPRI, given the admissions at both priorities.
pub fn frac_admitted_at_lopri(
    parent: &FlowInfo,
    source: FlowVolumeSource,
    hipri_rate_limit_bps: i64,
    lopri_rate_limit_bps: i64,
) -> f64 {
    let demand = flow_volume(parent, source);
    if demand <= 0 {
        return 0.0;
    }
    if hipri_rate_limit_bps + lopri_rate_limit_bps <= 0 {
        return 0.0;
    }
    if hipri_rate_limit_bps == 0 {
        return 1.0;
    }
    // The HIPRI overflow share, capped by LOPRI's share of total admission.
    let overflow = (demand - hipri_rate_limit_bps) as f64 / demand as f64;
    let lopri_share = lopri_rate_limit_bps as f64
        / (hipri_rate_limit_bps + lopri_rate_limit_bps) as f64;
    overflow.min(lopri_share).max(0.0)
}

/// The LOPRI fraction to use when the controller should probe for latent
/// demand.
///
/// Probing triggers when `hipri_rate_limit ≤ demand ≤ demand_multiplier *
/// hipri_rate_limit`: HIPRI is fully used but it is ambiguous whether more
/// demand exists. The probe diverts the smallest child to LOPRI (if that fits
/// within the LOPRI admission and raises the fraction); otherwise
/// `lopri_frac` is returned unchanged.
pub fn frac_admitted_at_lopri_to_probe(
    view: &dyn AggInfoView,
    hipri_rate_limit_bps: i64,
    lopri_rate_limit_bps: i64,
    demand_multiplier: f64,
    lopri_frac: f64,
) -> f64 {
    let demand = view.parent().predicted_demand_bps;
    if demand < hipri_rate_limit_bps {
        return lopri_frac;
    }
    if (demand as f64) > demand_multiplier * hipri_rate_limit_bps as f64 {
        return lopri_frac;
    }
    let Some(smallest) = view.children().iter().map(|c| c.volume_bps).min() else {
        return lopri_frac;
    };
    if smallest > lopri_rate_limit_bps || demand <= 0 {
        return lopri_frac;
    }
    let candidate = smallest as f64 / demand as f64;
    if candidate > lopri_frac {
        candidate
    } else {
        lopri_frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_proto::FlowMarker;

    pub(crate) fn children_with_demands_and_pri(
        demands_islopri: &[(i64, bool)],
    ) -> Vec<ChildFlowInfo> {
        let n = demands_islopri.len() as u64;
        demands_islopri
            .iter()
            .enumerate()
            .map(|(i, &(demand, is_lopri))| ChildFlowInfo {
                child_id: (u64::MAX / n) * i as u64,
                job: String::new(),
                volume_bps: demand,
                currently_lopri: is_lopri,
            })
            .collect()
    }

    struct TestView {
        parent: FlowInfo,
        children: Vec<ChildFlowInfo>,
    }

    impl AggInfoView for TestView {
        fn parent(&self) -> &FlowInfo {
            &self.parent
        }
        fn children(&self) -> &[ChildFlowInfo] {
            &self.children
        }
    }

    fn parent_with_demand(demand: i64) -> FlowInfo {
        FlowInfo {
            flow: Some(FlowMarker::default()),
            predicted_demand_bps: demand,
            ..Default::default()
        }
    }

    fn probe_view(parent_demand: i64, child_demands: &[i64]) -> TestView {
        let n = child_demands.len() as u64;
        TestView {
            parent: parent_with_demand(parent_demand),
            children: child_demands
                .iter()
                .enumerate()
                .map(|(i, &d)| ChildFlowInfo {
                    child_id: (u64::MAX / n) * i as u64,
                    job: String::new(),
                    volume_bps: d,
                    currently_lopri: false,
                })
                .collect(),
        }
    }

    #[test]
    fn frac_admitted_basic() {
        let src = FlowVolumeSource::PredictedDemand;
        assert_eq!(
            frac_admitted_at_lopri(&parent_with_demand(1000), src, 600, 200),
            0.25
        );
        assert_eq!(
            frac_admitted_at_lopri(&parent_with_demand(640), src, 600, 200),
            0.0625
        );
        assert_eq!(
            frac_admitted_at_lopri(&parent_with_demand(500), src, 600, 200),
            0.0
        );
    }

    #[test]
    fn frac_admitted_extremes() {
        let usage = |bps: i64| FlowInfo {
            ewma_usage_bps: bps,
            ..Default::default()
        };
        let src = FlowVolumeSource::Usage;
        assert_eq!(frac_admitted_at_lopri(&usage(1000), src, 0, 900), 1.0);
        assert_eq!(frac_admitted_at_lopri(&usage(1000), src, 600, 0), 0.0);

        let pd = FlowVolumeSource::PredictedDemand;
        assert_eq!(frac_admitted_at_lopri(&parent_with_demand(1000), pd, 0, 0), 0.0);
        assert_eq!(frac_admitted_at_lopri(&parent_with_demand(0), pd, 600, 0), 0.0);
    }

    #[test]
    fn probe_when_ambiguous() {
        let demands = [1000, 800, 600, 400, 200, 100];

        let view = probe_view(2499, &demands);
        assert_eq!(
            frac_admitted_at_lopri_to_probe(&view, 2500, 600, 1.9, -1.0),
            -1.0
        );

        let view = probe_view(2500, &demands);
        let got = frac_admitted_at_lopri_to_probe(&view, 2500, 600, 1.9, -1.0);
        assert!((got - 0.04).abs() < 1e-5, "got {got}");

        let view = probe_view(3000, &demands);
        let got = frac_admitted_at_lopri_to_probe(&view, 2500, 600, 1.9, 0.2);
        assert!((got - 0.2).abs() < 1e-5, "got {got}");

        let got = frac_admitted_at_lopri_to_probe(&view, 2500, 600, 1.2, 0.2);
        assert!((got - 0.2).abs() < 1e-5, "got {got}");

        assert_eq!(frac_admitted_at_lopri_to_probe(&view, 2500, 0, 1.9, 0.0), 0.0);
    }

    #[test]
    fn clamp_handles_nan_and_infinities() {
        assert_eq!(clamp_frac_lopri(f64::NAN), 0.0);
        assert_eq!(clamp_frac_lopri(-0.5), 0.0);
        assert_eq!(clamp_frac_lopri(0.0), 0.0);
        assert_eq!(clamp_frac_lopri(0.5), 0.5);
        assert_eq!(clamp_frac_lopri(1.0), 1.0);
        assert_eq!(clamp_frac_lopri(1.5), 1.0);
        assert_eq!(clamp_frac_lopri(f64::INFINITY), 1.0);
        assert_eq!(clamp_frac_lopri(f64::NEG_INFINITY), 0.0);
        assert_eq!(clamp_frac_lopri_silent(f64::NAN), 0.0);
    }

    #[test]
    fn job_level_knapsack() {
        let mk = |demand: i64, is_lopri: bool, job: &str| ChildFlowInfo {
            child_id: 0,
            job: job.to_string(),
            volume_bps: demand,
            currently_lopri: is_lopri,
        };
        let mut children = vec![
            mk(200, true, "YT"),
            mk(100, false, "YT"),
            mk(300, false, "FB"),
            mk(100, true, "FB"),
        ];
        for (i, c) in children.iter_mut().enumerate() {
            c.child_id = (u64::MAX / 4) * i as u64;
        }
        let view = TestView {
            parent: parent_with_demand(700),
            children,
        };

        let mut selector = DowngradeSelector::new(DowngradeSelectorConfig {
            selector_type: DowngradeSelectorType::KnapsackSolver,
            downgrade_jobs: true,
            downgrade_usage: false,
        });

        let t = true;
        let f = false;
        assert_eq!(selector.pick_lopri_children(&view, 0.428), vec![f, f, f, f]);
        assert_eq!(selector.pick_lopri_children(&view, 0.429), vec![t, t, f, f]);
        assert_eq!(selector.pick_lopri_children(&view, 0.571), vec![t, t, f, f]);
        assert_eq!(selector.pick_lopri_children(&view, 0.572), vec![f, f, t, t]);
        assert_eq!(selector.pick_lopri_children(&view, 0.999), vec![f, f, t, t]);
        assert_eq!(selector.pick_lopri_children(&view, 1.000), vec![t, t, t, t]);
    }
}
