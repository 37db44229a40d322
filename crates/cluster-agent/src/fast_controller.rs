// SPDX-License-Identifier: Apache-2.0

//! The fast cluster controller: sampling-based aggregation, hashing
//! downgrade, and diff broadcast.
//!
//! Built for very large fleets: the write path touches only a shard lock,
//! per-FG work runs on a worker pool, per-host state lives in a
//! [`ParIndexedMap`] so unrelated hosts never contend, and only hosts whose
//! QoS changed (or who have an unsent update) are written to.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use heyp_alg::downgrade::{
    clamp_frac_lopri, clamp_frac_lopri_silent, AggInfoView, HashingDowngradeSelector,
    UnorderedIds,
};
use heyp_alg::feedback::DowngradeFracController;
use heyp_alg::sampler::ThresholdSampler;
use heyp_common::{Executor, ParId, ParIndexedMap};
use heyp_config::FastClusterControllerConfig;
use heyp_proto::marker::{self, ClusterFlowKey};
use heyp_proto::{AllocBundle, FlowAlloc, FlowMarker, InfoBundle};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::controller::{ClusterController, ListenerHandle, OnNewBundle};
use crate::fast_aggregator::FastAggregator;
use crate::per_agg::MAX_CHILD_BANDWIDTH_BPS;

const EWMA_WEIGHT: f64 = 0.3;
const BROADCAST_CHUNK_SIZE: usize = 512;

#[derive(Default)]
struct ChildState {
    agg_is_lopri: Vec<bool>,
    lis_new_bundle_funcs: HashMap<u64, OnNewBundle>,
    broadcasted_latest_state: bool,
    gen_seen: u64,
    saw_data: bool,
}

#[derive(Default)]
struct FastPerAggState {
    downgrade_frac: f64,
    ewma_max_child_usage: Option<f64>,
}

struct FastInner {
    agg_id_to_flow: Vec<FlowMarker>,
    approval_bps: Vec<i64>,
    aggregator: Arc<FastAggregator>,
    agg_selectors: Vec<Mutex<HashingDowngradeSelector>>,
    agg_states: Vec<Mutex<FastPerAggState>>,
    frac_controller: Option<DowngradeFracController>,
    child_states: ParIndexedMap<u64, ChildState>,
    next_lis_id: AtomicU64,
    // Copy of the child-state id map used by the control loop; RPC threads
    // only append to `pending_host_ids`.
    host_to_par: RwLock<BTreeMap<u64, ParId>>,
    pending_host_ids: Mutex<Vec<(u64, ParId)>>,
}

/// See the module docs.
pub struct FastClusterController {
    inner: Arc<FastInner>,
    exec: Executor,
}

/// Calls `func` for every (host, par-id) pair selected by `ids`.
pub fn for_each_selected(
    id_to_par: &BTreeMap<u64, ParId>,
    ids: &UnorderedIds,
    mut func: impl FnMut(u64, ParId),
) {
    for r in &ids.ranges {
        if r.hi < r.lo {
            continue;
        }
        for (&host_id, &par_id) in id_to_par.range(r.lo..=r.hi) {
            func(host_id, par_id);
        }
    }
    for &p in &ids.points {
        if let Some(&par_id) = id_to_par.get(&p) {
            func(p, par_id);
        }
    }
}

impl FastClusterController {
    /// Creates a fast controller for the FGs in `cluster_wide_allocs`.
    pub fn create(
        config: &FastClusterControllerConfig,
        cluster_wide_allocs: &AllocBundle,
    ) -> Self {
        let mut agg_flow_to_id = HashMap::new();
        let mut agg_id_to_flow = Vec::new();
        let mut approval_bps = Vec::new();
        for a in &cluster_wide_allocs.flow_allocs {
            let _ = agg_flow_to_id.insert(ClusterFlowKey::from(a.flow()), agg_id_to_flow.len());
            agg_id_to_flow.push(marker::to_cluster_flow(a.flow()));
            approval_bps.push(a.hipri_rate_limit_bps);
        }

        let samplers: Vec<ThresholdSampler> = approval_bps
            .iter()
            .map(|&approval| ThresholdSampler::new(config.target_num_samples, approval as f64))
            .collect();

        let frac_controller = config.downgrade_frac_controller.map(DowngradeFracController::new);
        if frac_controller.is_some() {
            info!("using feedback control for downgrade fraction");
        } else {
            info!("not using feedback control for downgrade fraction");
        }

        let num_aggs = agg_id_to_flow.len();
        let aggregator = Arc::new(FastAggregator::new(
            agg_flow_to_id,
            agg_id_to_flow.clone(),
            samplers,
        ));
        let mut agg_selectors = Vec::with_capacity(num_aggs);
        agg_selectors.resize_with(num_aggs, Mutex::default);
        let mut agg_states = Vec::with_capacity(num_aggs);
        agg_states.resize_with(num_aggs, Mutex::default);

        Self {
            inner: Arc::new(FastInner {
                agg_id_to_flow,
                approval_bps,
                aggregator,
                agg_selectors,
                agg_states,
                frac_controller,
                child_states: ParIndexedMap::new(),
                next_lis_id: AtomicU64::new(1),
                host_to_par: RwLock::new(BTreeMap::new()),
                pending_host_ids: Mutex::new(Vec::new()),
            }),
            exec: Executor::new(config.num_threads, "ctl-work"),
        }
    }
}

impl FastInner {
    fn compute_frac_lopri(&self, agg_id: usize, snap: &crate::fast_aggregator::FastAggInfo) -> f64 {
        let hipri_admission = self.approval_bps[agg_id];
        let mut agg_state = self.agg_states[agg_id].lock();
        if let Some(frac_controller) = &self.frac_controller {
            let mut max_child_usage = 0.0f64;
            for child in snap.children() {
                max_child_usage = max_child_usage.max(child.volume_bps as f64);
            }
            let ewma = match agg_state.ewma_max_child_usage {
                None => max_child_usage,
                Some(prev) => EWMA_WEIGHT * max_child_usage + (1.0 - EWMA_WEIGHT) * prev,
            };
            agg_state.ewma_max_child_usage = Some(ewma);

            let downgrade_frac_inc = if snap.parent().ewma_usage_bps < hipri_admission {
                -0.2
            } else {
                frac_controller.traffic_frac_to_downgrade(
                    snap.parent().ewma_hipri_usage_bps as f64,
                    snap.parent().ewma_lopri_usage_bps as f64,
                    hipri_admission as f64,
                    ewma,
                )
            };
            agg_state.downgrade_frac =
                clamp_frac_lopri_silent(agg_state.downgrade_frac + downgrade_frac_inc);
            agg_state.downgrade_frac
        } else {
            let usage = snap.parent().ewma_usage_bps;
            let lopri_bps = (usage - hipri_admission).max(0);
            clamp_frac_lopri(lopri_bps as f64 / usage as f64)
        }
    }

    fn broadcast_state_unconditional(&self, base_bundle: &mut AllocBundle, state: &mut ChildState) {
        for (i, alloc) in base_bundle.flow_allocs.iter_mut().enumerate() {
            let is_lopri = state.agg_is_lopri.get(i).copied().unwrap_or(false);
            if is_lopri {
                alloc.hipri_rate_limit_bps = 0;
                alloc.lopri_rate_limit_bps = MAX_CHILD_BANDWIDTH_BPS;
            } else {
                alloc.hipri_rate_limit_bps = MAX_CHILD_BANDWIDTH_BPS;
                alloc.lopri_rate_limit_bps = 0;
            }
        }
        base_bundle.gen = if state.saw_data { state.gen_seen } else { 0 };
        for func in state.lis_new_bundle_funcs.values() {
            func(base_bundle);
        }
    }

    fn broadcast_state_if_updated(&self, base_bundle: &mut AllocBundle, state: &mut ChildState) {
        if state.broadcasted_latest_state {
            return;
        }
        self.broadcast_state_unconditional(base_bundle, state);
        state.broadcasted_latest_state = true;
    }

    fn make_broadcast_bundle(&self) -> AllocBundle {
        AllocBundle {
            flow_allocs: self
                .agg_id_to_flow
                .iter()
                .map(|flow| FlowAlloc {
                    flow: Some(flow.clone()),
                    hipri_rate_limit_bps: 0,
                    lopri_rate_limit_bps: 0,
                })
                .collect(),
            gen: 0,
        }
    }
}

impl ClusterController for FastClusterController {
    fn update_info(&self, _bundler_id: ParId, info: &InfoBundle) {
        self.inner.aggregator.update_info(info);
    }

    fn compute_and_broadcast(&self) {
        let inner = &self.inner;

        // Step 1: snapshot usage and catch up on host ids.
        let selector_snapshot: Arc<Vec<HashingDowngradeSelector>> = Arc::new(
            inner.agg_selectors.iter().map(|s| s.lock().clone()).collect(),
        );
        let snap_infos = Arc::new(FastAggregator::collect_snapshot(
            &inner.aggregator,
            &self.exec,
            selector_snapshot,
        ));
        {
            let mut host_to_par = inner.host_to_par.write();
            for (host_id, par_id) in inner.pending_host_ids.lock().drain(..) {
                let _ = host_to_par.insert(host_id, par_id);
            }
        }

        // Step 2: downgrade selection and state update, parallel per FG.
        let num_aggs = inner.agg_id_to_flow.len();
        let par_ids_to_bcast: Arc<Vec<Mutex<Vec<ParId>>>> =
            Arc::new((0..num_aggs).map(|_| Mutex::new(Vec::new())).collect());

        let group = self.exec.new_task_group();
        for agg_id in 0..num_aggs {
            let inner = Arc::clone(inner);
            let snap_infos = Arc::clone(&snap_infos);
            let par_ids_to_bcast = Arc::clone(&par_ids_to_bcast);
            group.add_task_no_status(move || {
                let snap = &snap_infos[agg_id];
                let frac_lopri = inner.compute_frac_lopri(agg_id, snap);
                info!(
                    src_dc = %snap.parent().flow().src_dc,
                    dst_dc = %snap.parent().flow().dst_dc,
                    approval = inner.approval_bps[agg_id],
                    est_usage = snap.parent().ewma_usage_bps,
                    num_children = snap.children().len(),
                    frac_lopri,
                    "allocating aggregate"
                );

                let downgrade_diff = inner.agg_selectors[agg_id].lock().pick_children(frac_lopri);

                let host_to_par = inner.host_to_par.read();
                // Record which hosts we just heard from, for gen echo.
                for hg in &snap.info_gen {
                    if let Some(&par_id) = host_to_par.get(&hg.host_id) {
                        inner.child_states.on_id(par_id, |state| {
                            state.gen_seen = state.gen_seen.max(hg.gen);
                            state.saw_data = true;
                        });
                    }
                }

                let mut to_bcast = par_ids_to_bcast[agg_id].lock();
                for_each_selected(&host_to_par, &downgrade_diff.to_downgrade, |_, par_id| {
                    to_bcast.push(par_id);
                    inner.child_states.on_id(par_id, |state| {
                        if state.agg_is_lopri.len() <= agg_id {
                            state.agg_is_lopri.resize(agg_id + 1, false);
                        }
                        state.agg_is_lopri[agg_id] = true;
                        state.broadcasted_latest_state = false;
                    });
                });
                for_each_selected(&host_to_par, &downgrade_diff.to_upgrade, |_, par_id| {
                    to_bcast.push(par_id);
                    inner.child_states.on_id(par_id, |state| {
                        if state.agg_is_lopri.len() <= agg_id {
                            state.agg_is_lopri.resize(agg_id + 1, false);
                        }
                        state.agg_is_lopri[agg_id] = false;
                        state.broadcasted_latest_state = false;
                    });
                });
            });
        }
        group.wait_all_no_status();

        // Step 3: notify affected children, in parallel chunks.
        let group = self.exec.new_task_group();
        for agg_id in 0..num_aggs {
            let par_ids = std::mem::take(&mut *par_ids_to_bcast[agg_id].lock());
            for chunk in par_ids.chunks(BROADCAST_CHUNK_SIZE) {
                let chunk = chunk.to_vec();
                let inner = Arc::clone(inner);
                group.add_task_no_status(move || {
                    let mut base_bundle = inner.make_broadcast_bundle();
                    for par_id in chunk {
                        inner.child_states.on_id(par_id, |state| {
                            inner.broadcast_state_if_updated(&mut base_bundle, state);
                        });
                    }
                });
            }
        }
        group.wait_all_no_status();
    }

    fn register_listener(
        &self,
        host_id: u64,
        on_new_bundle: OnNewBundle,
    ) -> Box<dyn ListenerHandle> {
        let res = self.inner.child_states.get_id(&host_id);
        if res.just_created {
            self.inner.pending_host_ids.lock().push((host_id, res.id));
        }
        let lis_id = self.inner.next_lis_id.fetch_add(1, Ordering::SeqCst);
        self.inner.child_states.on_id(res.id, |state| {
            let _ = state.lis_new_bundle_funcs.insert(lis_id, on_new_bundle.clone());
        });
        Box::new(FastListener {
            inner: Arc::clone(&self.inner),
            host_par_id: res.id,
            lis_id,
        })
    }

    fn get_bundler_id(&self, _bundler: &FlowMarker) -> ParId {
        0 // currently unused by the fast controller
    }
}

struct FastListener {
    inner: Arc<FastInner>,
    host_par_id: ParId,
    lis_id: u64,
}

impl ListenerHandle for FastListener {}

impl Drop for FastListener {
    fn drop(&mut self) {
        self.inner.child_states.on_id(self.host_par_id, |state| {
            let _ = state.lis_new_bundle_funcs.remove(&self.lis_id);
        });
    }
}
