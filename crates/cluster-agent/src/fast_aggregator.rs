// SPDX-License-Identifier: Apache-2.0

//! Sharded, sampling-based aggregation for the fast controller.
//!
//! Incoming infos land in one of a fixed number of shards keyed by the
//! bundler's host id, so the RPC threads contend only on their shard's
//! lock. A snapshot drains all shards, aggregates them in parallel on the
//! worker pool, and estimates per-FG HIPRI/LOPRI usage with the threshold
//! sampler's reweighting.

use std::collections::HashMap;
use std::sync::Arc;

use heyp_alg::downgrade::{AggInfoView, ChildFlowInfo, HashingDowngradeSelector};
use heyp_alg::sampler::{AggUsageEstimator, ThresholdSampler};
use heyp_common::Executor;
use heyp_proto::marker::ClusterFlowKey;
use heyp_proto::{FlowInfo, FlowMarker, InfoBundle};
use parking_lot::Mutex;
use tracing::debug;

pub(crate) const NUM_INFO_SHARDS: usize = 8;

/// A bundler generation observed in a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostGen {
    /// The reporting host.
    pub host_id: u64,
    /// Its generation counter.
    pub gen: u64,
}

/// One FG's aggregate as seen by the fast controller.
#[derive(Clone, Debug)]
pub struct FastAggInfo {
    /// Index of the FG in the controller's tables.
    pub agg_id: usize,
    /// Estimated aggregate usage (split by priority) for the FG.
    pub parent: FlowInfo,
    /// Children observed since the last snapshot.
    pub children: Vec<ChildFlowInfo>,
    /// Generations of the hosts heard from since the last snapshot.
    pub info_gen: Vec<HostGen>,
}

impl AggInfoView for FastAggInfo {
    fn parent(&self) -> &FlowInfo {
        &self.parent
    }

    fn children(&self) -> &[ChildFlowInfo] {
        &self.children
    }
}

#[derive(Clone, Copy, Debug)]
struct Info {
    agg_id: usize,
    child_id: u64,
    volume_bps: i64,
    currently_lopri: bool,
}

#[derive(Default)]
struct InfoShard {
    infos: Vec<Info>,
    gens: Vec<HostGen>,
}

struct PrioEstimators {
    hipri: AggUsageEstimator,
    lopri: AggUsageEstimator,
}

/// See the module docs.
pub struct FastAggregator {
    agg_flow_to_id: HashMap<ClusterFlowKey, usize>,
    agg_id_to_flow: Vec<FlowMarker>,
    samplers: Vec<ThresholdSampler>,
    shards: Vec<Mutex<InfoShard>>,
}

impl FastAggregator {
    /// Creates an aggregator for the FGs in `agg_flow_to_id`, one sampler
    /// per FG.
    pub fn new(
        agg_flow_to_id: HashMap<ClusterFlowKey, usize>,
        agg_id_to_flow: Vec<FlowMarker>,
        samplers: Vec<ThresholdSampler>,
    ) -> Self {
        assert_eq!(agg_id_to_flow.len(), samplers.len());
        let mut shards = Vec::with_capacity(NUM_INFO_SHARDS);
        shards.resize_with(NUM_INFO_SHARDS, Mutex::default);
        Self {
            agg_flow_to_id,
            agg_id_to_flow,
            samplers,
            shards,
        }
    }

    /// Ingests one report. Thread safe; contends only on one shard lock.
    pub fn update_info(&self, info: &InfoBundle) {
        let host_id = info.bundler().host_id;
        let shard_idx = (host_id % NUM_INFO_SHARDS as u64) as usize;

        let mut got = Vec::with_capacity(self.agg_flow_to_id.len());
        for fi in &info.flow_infos {
            let Some(&agg_id) = self.agg_flow_to_id.get(&ClusterFlowKey::from(fi.flow())) else {
                continue;
            };
            got.push(Info {
                agg_id,
                child_id: host_id,
                volume_bps: fi.ewma_usage_bps,
                currently_lopri: fi.currently_lopri,
            });
        }

        let mut shard = self.shards[shard_idx].lock();
        shard.infos.extend_from_slice(&got);
        shard.gens.push(HostGen {
            host_id,
            gen: info.gen,
        });
    }

    fn aggregate(
        &self,
        shard: InfoShard,
        selectors: &[HashingDowngradeSelector],
    ) -> (Vec<FastAggInfo>, Vec<PrioEstimators>, Vec<HostGen>) {
        let num_aggs = self.agg_id_to_flow.len();
        let mut aggs: Vec<FastAggInfo> = (0..num_aggs)
            .map(|agg_id| FastAggInfo {
                agg_id,
                parent: FlowInfo::default(),
                children: Vec::new(),
                info_gen: Vec::new(),
            })
            .collect();
        let mut estimators: Vec<PrioEstimators> = self
            .samplers
            .iter()
            .map(|s| PrioEstimators {
                hipri: s.new_agg_usage_estimator(),
                lopri: s.new_agg_usage_estimator(),
            })
            .collect();

        for info in shard.infos {
            aggs[info.agg_id].children.push(ChildFlowInfo {
                child_id: info.child_id,
                job: String::new(),
                volume_bps: info.volume_bps,
                currently_lopri: info.currently_lopri,
            });
            if selectors[info.agg_id].is_lopri(info.child_id) {
                estimators[info.agg_id].lopri.record_sample(info.volume_bps as f64);
            } else {
                estimators[info.agg_id].hipri.record_sample(info.volume_bps as f64);
            }
        }

        (aggs, estimators, shard.gens)
    }

    /// Drains all shards and combines them into one snapshot per FG.
    ///
    /// Call from a single thread; runs concurrently with `update_info`.
    pub fn collect_snapshot(
        this: &Arc<Self>,
        exec: &Executor,
        selectors: Arc<Vec<HashingDowngradeSelector>>,
    ) -> Vec<FastAggInfo> {
        type Part = (Vec<FastAggInfo>, Vec<PrioEstimators>, Vec<HostGen>);
        let parts: Arc<Vec<Mutex<Option<Part>>>> = Arc::new(
            (0..NUM_INFO_SHARDS).map(|_| Mutex::new(None)).collect(),
        );

        let group = exec.new_task_group();
        for shard_idx in 0..NUM_INFO_SHARDS {
            let this = Arc::clone(this);
            let parts = Arc::clone(&parts);
            let selectors = Arc::clone(&selectors);
            group.add_task_no_status(move || {
                let taken = std::mem::take(&mut *this.shards[shard_idx].lock());
                let part = this.aggregate(taken, &selectors);
                *parts[shard_idx].lock() = Some(part);
            });
        }
        group.wait_all_no_status();

        let num_aggs = this.agg_id_to_flow.len();
        let mut combined: Vec<FastAggInfo> = (0..num_aggs)
            .map(|agg_id| FastAggInfo {
                agg_id,
                parent: FlowInfo {
                    flow: Some(this.agg_id_to_flow[agg_id].clone()),
                    ..Default::default()
                },
                children: Vec::new(),
                info_gen: Vec::new(),
            })
            .collect();

        let mut all_gens: Vec<HostGen> = Vec::new();
        let mut num_infos = 0usize;
        let mut sums: Vec<(f64, f64)> = vec![(0.0, 0.0); num_aggs];
        for slot in parts.iter() {
            let Some((aggs, estimators, gens)) = slot.lock().take() else {
                continue;
            };
            for (agg_id, agg) in aggs.into_iter().enumerate() {
                num_infos += agg.children.len();
                combined[agg_id].children.extend(agg.children);
                sums[agg_id].0 += estimators[agg_id].hipri.est_usage();
                sums[agg_id].1 += estimators[agg_id].lopri.est_usage();
            }
            all_gens.extend(gens);
        }
        for (agg, (hipri_bps, lopri_bps)) in combined.iter_mut().zip(&sums) {
            agg.parent.ewma_hipri_usage_bps = *hipri_bps as i64;
            agg.parent.ewma_lopri_usage_bps = *lopri_bps as i64;
            agg.parent.ewma_usage_bps = (*hipri_bps + *lopri_bps) as i64;
            // Whichever volume source is selected downstream is populated.
            agg.parent.predicted_demand_bps = agg.parent.ewma_usage_bps;
            agg.info_gen = all_gens.clone();
        }
        debug!(
            num_infos,
            num_aggs,
            "collected fast-aggregator snapshot"
        );
        combined
    }
}
