// SPDX-License-Identifier: Apache-2.0

//! The full cluster controller: aggregator → per-FG allocator →
//! bundle-by-host → broadcast.
//!
//! Host-reported QoS is not authoritative (hosts observe DSCP, not intent),
//! so incoming flow infos are rewritten to carry the controller's
//! last-broadcast decision before aggregation. The last-broadcast map is
//! swapped atomically so the RPC read path never blocks on a tick in
//! progress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use heyp_common::{ParId, ParIndexedMap, TimedMutex};
use heyp_flows::FlowAggregator;
use heyp_proto::marker::{self, CompareFlowOptions, FlowKey};
use heyp_proto::{AllocBundle, FlowMarker, InfoBundle};
use tracing::debug;

use crate::allocator::{bundle_by_host, ClusterAllocator};
use crate::controller::{ClusterController, ListenerHandle, OnNewBundle};

const LONG_BCAST_LOCK: Duration = Duration::from_millis(50);
const LONG_STATE_LOCK: Duration = Duration::from_millis(100);

type LastBundleMap = HashMap<u64, AllocBundle>;

#[derive(Default)]
struct BroadcastState {
    next_lis_id: u64,
    new_bundle_funcs: HashMap<u64, HashMap<u64, OnNewBundle>>,
}

/// See the module docs.
pub struct FullClusterController {
    aggregator: FlowAggregator,
    state_mu: TimedMutex<()>,
    allocator: ClusterAllocator,
    broadcasting: Arc<TimedMutex<BroadcastState>>,
    last_alloc_bundle: ArcSwap<LastBundleMap>,
    bundler_ids: ParIndexedMap<FlowKey, ()>,
}

/// What the last broadcast said about a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BroadcastQos {
    Hipri,
    Lopri,
    Unknown,
}

fn lookup_alloc(bundles: &LastBundleMap, host_id: u64, flow: &FlowMarker) -> BroadcastQos {
    let Some(bundle) = bundles.get(&host_id) else {
        return BroadcastQos::Unknown;
    };
    let fg_only = CompareFlowOptions {
        cmp_fg: true,
        cmp_job: false,
        cmp_src_host: false,
        cmp_conn: false,
        cmp_seqnum: false,
    };
    for alloc in &bundle.flow_allocs {
        if marker::is_same_flow(alloc.flow(), flow, fg_only) {
            if alloc.lopri_rate_limit_bps > 0 {
                return BroadcastQos::Lopri;
            }
            return BroadcastQos::Hipri;
        }
    }
    BroadcastQos::Unknown
}

impl FullClusterController {
    /// Creates a controller from its two stages.
    pub fn new(aggregator: FlowAggregator, allocator: ClusterAllocator) -> Self {
        Self {
            aggregator,
            state_mu: TimedMutex::new(()),
            allocator,
            broadcasting: Arc::new(TimedMutex::new(BroadcastState::default())),
            last_alloc_bundle: ArcSwap::from_pointee(LastBundleMap::new()),
            bundler_ids: ParIndexedMap::new(),
        }
    }
}

impl ClusterController for FullClusterController {
    fn update_info(&self, _bundler_id: ParId, info: &InfoBundle) {
        let mut info_with_intended_qos = info.clone();
        let last_alloc_bundle = self.last_alloc_bundle.load();
        let host_id = info_with_intended_qos.bundler().host_id;
        for fi in &mut info_with_intended_qos.flow_infos {
            // Per-QoS usage is only meaningful at the cluster-FG level.
            // Reset it in case a host populated it.
            fi.ewma_hipri_usage_bps = 0;
            fi.ewma_lopri_usage_bps = 0;
            let flow = fi.flow.clone().unwrap_or_default();
            match lookup_alloc(&last_alloc_bundle, host_id, &flow) {
                BroadcastQos::Hipri => fi.currently_lopri = false,
                BroadcastQos::Lopri => fi.currently_lopri = true,
                BroadcastQos::Unknown => {} // leave QoS alone
            }
        }
        self.aggregator.update(&info_with_intended_qos);
    }

    fn compute_and_broadcast(&self) {
        let guard = self
            .state_mu
            .lock_warn_long(LONG_STATE_LOCK, "state_mu in compute_and_broadcast");
        self.allocator.reset();
        self.aggregator.for_each_agg(|time, info| {
            debug!(?time, flow = ?info.parent.flow(), "got agg info");
            self.allocator.add_info(time, info.clone());
        });
        let allocs = self.allocator.get_allocs();
        drop(guard);

        let alloc_bundles = Arc::new(bundle_by_host(allocs));

        let broadcasting = self
            .broadcasting
            .lock_warn_long(LONG_BCAST_LOCK, "broadcasting_mu in compute_and_broadcast");
        let mut num = 0;
        for (host, bundle) in alloc_bundles.iter() {
            if let Some(funcs) = broadcasting.new_bundle_funcs.get(host) {
                for func in funcs.values() {
                    func(bundle);
                    num += 1;
                }
            }
        }
        debug!(num, "broadcast alloc bundles");
        self.last_alloc_bundle.store(alloc_bundles);
    }

    fn register_listener(
        &self,
        host_id: u64,
        on_new_bundle: OnNewBundle,
    ) -> Box<dyn ListenerHandle> {
        let mut broadcasting = self
            .broadcasting
            .lock_warn_long(LONG_BCAST_LOCK, "broadcasting_mu in register_listener");
        let lis_id = broadcasting.next_lis_id;
        broadcasting.next_lis_id += 1;
        let _ = broadcasting
            .new_bundle_funcs
            .entry(host_id)
            .or_default()
            .insert(lis_id, on_new_bundle);
        Box::new(FullListener {
            broadcasting: Arc::clone(&self.broadcasting),
            host_id,
            lis_id,
        })
    }

    fn get_bundler_id(&self, bundler: &FlowMarker) -> ParId {
        self.bundler_ids.get_id(&FlowKey::from(bundler)).id
    }
}

struct FullListener {
    broadcasting: Arc<TimedMutex<BroadcastState>>,
    host_id: u64,
    lis_id: u64,
}

impl ListenerHandle for FullListener {}

impl Drop for FullListener {
    fn drop(&mut self) {
        let mut broadcasting = self
            .broadcasting
            .lock_warn_long(LONG_BCAST_LOCK, "broadcasting_mu in listener drop");
        if let Some(funcs) = broadcasting.new_bundle_funcs.get_mut(&self.host_id) {
            let _ = funcs.remove(&self.lis_id);
            if funcs.is_empty() {
                let _ = broadcasting.new_bundle_funcs.remove(&self.host_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use heyp_alg::demand::BweDemandPredictor;
    use heyp_config::{ClusterAllocatorConfig, ClusterAllocatorType};
    use heyp_proto::{FlowAlloc, FlowInfo, Timestamp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fg(dst_dc: &str) -> FlowMarker {
        FlowMarker {
            src_dc: "chicago".into(),
            dst_dc: dst_dc.into(),
            ..Default::default()
        }
    }

    fn admissions() -> AllocBundle {
        AllocBundle {
            flow_allocs: vec![FlowAlloc {
                flow: Some(fg("detroit")),
                hipri_rate_limit_bps: 1000,
                lopri_rate_limit_bps: 0,
            }],
            gen: 0,
        }
    }

    fn controller() -> FullClusterController {
        let aggregator = FlowAggregator::new_host_to_cluster(
            Box::new(BweDemandPredictor::new(ChronoDuration::seconds(60), 1.0, 0)),
            ChronoDuration::seconds(60),
        );
        let config = ClusterAllocatorConfig {
            allocator_type: ClusterAllocatorType::Bwe,
            ..Default::default()
        };
        let allocator = ClusterAllocator::create(&config, &admissions(), None);
        FullClusterController::new(aggregator, allocator)
    }

    fn info_bundle(host_id: u64, demand: i64) -> InfoBundle {
        InfoBundle {
            bundler: Some(FlowMarker {
                host_id,
                ..Default::default()
            }),
            timestamp: Some(Timestamp {
                seconds: 1,
                nanos: 0,
            }),
            flow_infos: vec![FlowInfo {
                flow: Some(FlowMarker {
                    src_dc: "chicago".into(),
                    dst_dc: "detroit".into(),
                    job: "app".into(),
                    host_id,
                    ..Default::default()
                }),
                predicted_demand_bps: demand,
                ewma_usage_bps: demand,
                ..Default::default()
            }],
            gen: 1,
        }
    }

    #[test]
    fn broadcasts_one_bundle_per_host() {
        let ctl = controller();
        let count_1 = Arc::new(AtomicUsize::new(0));
        let count_2 = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count_1);
        let lis1 = ctl.register_listener(
            1,
            Arc::new(move |bundle: &AllocBundle| {
                assert_eq!(bundle.flow_allocs.len(), 1);
                assert!(bundle.flow_allocs[0].hipri_rate_limit_bps > 0);
                let _ = c1.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let c2 = Arc::clone(&count_2);
        let lis2 = ctl.register_listener(
            2,
            Arc::new(move |_: &AllocBundle| {
                let _ = c2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let id1 = ctl.get_bundler_id(info_bundle(1, 600).bundler());
        ctl.update_info(id1, &info_bundle(1, 600));
        let id2 = ctl.get_bundler_id(info_bundle(2, 400).bundler());
        ctl.update_info(id2, &info_bundle(2, 400));

        ctl.compute_and_broadcast();
        assert_eq!(count_1.load(Ordering::SeqCst), 1);
        assert_eq!(count_2.load(Ordering::SeqCst), 1);

        // Dropping a listener stops its broadcasts.
        drop(lis1);
        ctl.update_info(id1, &info_bundle(1, 600));
        ctl.update_info(id2, &info_bundle(2, 400));
        ctl.compute_and_broadcast();
        assert_eq!(count_1.load(Ordering::SeqCst), 1);
        assert_eq!(count_2.load(Ordering::SeqCst), 2);
        drop(lis2);
    }

    #[test]
    fn lookup_alloc_uses_fg_view() {
        let mut bundles = LastBundleMap::new();
        let _ = bundles.insert(
            7,
            AllocBundle {
                flow_allocs: vec![
                    FlowAlloc {
                        flow: Some(fg("detroit")),
                        hipri_rate_limit_bps: 0,
                        lopri_rate_limit_bps: 100,
                    },
                    FlowAlloc {
                        flow: Some(fg("new_york")),
                        hipri_rate_limit_bps: 100,
                        lopri_rate_limit_bps: 0,
                    },
                ],
                gen: 0,
            },
        );

        // A conn-level flow matches its FG's alloc.
        let mut conn = fg("detroit");
        conn.host_id = 7;
        conn.src_port = 1234;
        assert_eq!(lookup_alloc(&bundles, 7, &conn), BroadcastQos::Lopri);

        let mut conn_ny = fg("new_york");
        conn_ny.host_id = 7;
        assert_eq!(lookup_alloc(&bundles, 7, &conn_ny), BroadcastQos::Hipri);

        assert_eq!(lookup_alloc(&bundles, 8, &conn), BroadcastQos::Unknown);
        assert_eq!(
            lookup_alloc(&bundles, 7, &fg("tokyo")),
            BroadcastQos::Unknown
        );
    }

    #[test]
    fn bundler_ids_are_stable() {
        let ctl = controller();
        let b1 = FlowMarker {
            host_id: 10,
            ..Default::default()
        };
        let b2 = FlowMarker {
            host_id: 11,
            ..Default::default()
        };
        let id1 = ctl.get_bundler_id(&b1);
        let id2 = ctl.get_bundler_id(&b2);
        assert_ne!(id1, id2);
        assert_eq!(ctl.get_bundler_id(&b1), id1);
    }
}
