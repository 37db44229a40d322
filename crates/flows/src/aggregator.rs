// SPDX-License-Identifier: Apache-2.0

//! Rolls up flow infos reported by bundlers into per-aggregate snapshots.
//!
//! Two presets exist: conn → host (used by the host-agent to bundle its
//! connection-level flows into host-flow reports) and host → cluster (used
//! by the cluster-agent to build per-FG aggregates from host reports).
//!
//! Each bundler's flows are tracked in an active and a dead map. An active
//! flow whose report is older than the usage history window moves to the
//! dead map, where its final byte counters are still charged to the
//! aggregate until the next snapshot.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use heyp_alg::demand::DemandPredictor;
use heyp_common::TimedMutex;
use heyp_proto::marker::{self, FlowKey};
use heyp_proto::{FlowInfo, FlowMarker, InfoBundle};
use tracing::{error, warn};

/// One aggregate snapshot: the parent measurement plus the active children.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct AggInfo {
    /// Aggregate-level info.
    pub parent: FlowInfo,
    /// The active children contributing to the aggregate.
    pub children: Vec<FlowInfo>,
}

/// Configuration of a [`FlowAggregator`].
pub struct Config {
    /// Window after which a silent child is considered dead; also the
    /// history window handed to the flow state.
    pub usage_history_window: Duration,
    /// Projects a child marker to its parent aggregate marker.
    pub get_agg_flow: fn(&FlowMarker) -> FlowMarker,
    /// Validity check applied to each reported child marker.
    pub is_valid_child: Option<fn(&FlowMarker) -> bool>,
}

struct BundleState {
    active: HashMap<FlowKey, (DateTime<Utc>, FlowInfo)>,
    dead: HashMap<FlowKey, (DateTime<Utc>, FlowInfo)>,
}

struct AggWip {
    state: crate::state::AggState,
    oldest_active: Option<DateTime<Utc>>,
    newest_dead: Option<DateTime<Utc>>,
    cum_hipri_usage_bytes: i64,
    cum_lopri_usage_bytes: i64,
    sum_ewma_usage_bps: i64,
    children: Vec<FlowInfo>,
}

struct Inner {
    bundle_states: HashMap<FlowKey, BundleState>,
    agg_wips: HashMap<FlowKey, AggWip>,
}

/// See the module docs.
pub struct FlowAggregator {
    config: Config,
    agg_demand_predictor: Box<dyn DemandPredictor>,
    mu: TimedMutex<Inner>,
}

const LONG_LOCK: StdDuration = StdDuration::from_secs(1);

impl FlowAggregator {
    /// Creates an aggregator with an explicit configuration.
    pub fn new(agg_demand_predictor: Box<dyn DemandPredictor>, config: Config) -> Self {
        Self {
            config,
            agg_demand_predictor,
            mu: TimedMutex::new(Inner {
                bundle_states: HashMap::new(),
                agg_wips: HashMap::new(),
            }),
        }
    }

    /// Aggregates connection-level flows up to host-flows.
    pub fn new_conn_to_host(
        host_demand_predictor: Box<dyn DemandPredictor>,
        usage_history_window: Duration,
    ) -> Self {
        Self::new(
            host_demand_predictor,
            Config {
                usage_history_window,
                get_agg_flow: marker::to_host_flow,
                is_valid_child: None,
            },
        )
    }

    /// Aggregates host-flows up to cluster FGs.
    pub fn new_host_to_cluster(
        cluster_demand_predictor: Box<dyn DemandPredictor>,
        usage_history_window: Duration,
    ) -> Self {
        Self::new(
            cluster_demand_predictor,
            Config {
                usage_history_window,
                get_agg_flow: marker::to_cluster_flow,
                is_valid_child: Some(marker::is_host_flow),
            },
        )
    }

    /// Ingests one info bundle: upserts its flows into the bundler's active
    /// map and promotes now-stale actives to dead.
    pub fn update(&self, bundle: &InfoBundle) {
        let timestamp = bundle
            .timestamp
            .map(|t| t.to_datetime())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-aggregator");
        let bs = inner
            .bundle_states
            .entry(FlowKey::from(bundle.bundler()))
            .or_insert_with(|| BundleState {
                active: HashMap::new(),
                dead: HashMap::new(),
            });

        for fi in &bundle.flow_infos {
            if let Some(is_valid_child) = self.config.is_valid_child {
                if !is_valid_child(fi.flow()) {
                    warn!(flow = ?fi.flow(), "dropping invalid child flow");
                    continue;
                }
            }
            let key = FlowKey::from(fi.flow());
            let _ = bs.dead.remove(&key);
            let _ = bs.active.insert(key, (timestamp, fi.clone()));
        }

        let window = self.config.usage_history_window;
        let stale: Vec<FlowKey> = bs
            .active
            .iter()
            .filter(|(_, (t, _))| *t + window < timestamp)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some((_, info)) = bs.active.remove(&key) {
                let _ = bs.dead.insert(key, (timestamp, info));
            }
        }
    }

    /// Forgets a bundler entirely.
    pub fn remove(&self, bundler: &FlowMarker) {
        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-aggregator");
        let _ = inner.bundle_states.remove(&FlowKey::from(bundler));
    }

    /// Walks all aggregates: accumulates the children of every bundler into
    /// each parent, refreshes the parent's flow state, and hands the
    /// snapshot to `func`.
    pub fn for_each_agg(&self, mut func: impl FnMut(DateTime<Utc>, &AggInfo)) {
        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-aggregator");
        let inner = &mut *inner;

        for wip in inner.agg_wips.values_mut() {
            wip.oldest_active = None;
            wip.newest_dead = None;
            wip.cum_hipri_usage_bytes = 0;
            wip.cum_lopri_usage_bytes = 0;
            wip.sum_ewma_usage_bps = 0;
            wip.children.clear();
        }

        let get_agg_flow = self.config.get_agg_flow;
        for bs in inner.bundle_states.values() {
            for (time, info) in bs.active.values() {
                let wip = get_agg_wip(&mut inner.agg_wips, get_agg_flow, info.flow());
                wip.oldest_active = Some(match wip.oldest_active {
                    Some(t) => t.min(*time),
                    None => *time,
                });
                wip.cum_hipri_usage_bytes += info.cum_hipri_usage_bytes;
                wip.cum_lopri_usage_bytes += info.cum_lopri_usage_bytes;
                wip.sum_ewma_usage_bps += info.ewma_usage_bps;
                wip.children.push(info.clone());
            }
            for (time, info) in bs.dead.values() {
                let wip = get_agg_wip(&mut inner.agg_wips, get_agg_flow, info.flow());
                wip.newest_dead = Some(match wip.newest_dead {
                    Some(t) => t.max(*time),
                    None => *time,
                });
                wip.cum_hipri_usage_bytes += info.cum_hipri_usage_bytes;
                wip.cum_lopri_usage_bytes += info.cum_lopri_usage_bytes;
            }
        }

        for wip in inner.agg_wips.values_mut() {
            let time = match (wip.oldest_active, wip.newest_dead) {
                (Some(t), _) => t,
                (None, Some(t)) => t,
                (None, None) => {
                    error!(
                        flow = ?wip.state.flow(),
                        "aggregate has no active or dead children"
                    );
                    DateTime::<Utc>::UNIX_EPOCH
                }
            };
            wip.state.update_usage(
                crate::state::AggUpdate {
                    time,
                    sum_child_usage_bps: wip.sum_ewma_usage_bps,
                    cum_hipri_usage_bytes: wip.cum_hipri_usage_bytes,
                    cum_lopri_usage_bytes: wip.cum_lopri_usage_bytes,
                    aux: None,
                },
                self.config.usage_history_window,
                self.agg_demand_predictor.as_ref(),
            );

            let agg_info = AggInfo {
                parent: wip.state.cur().clone(),
                children: wip.children.clone(),
            };
            func(time, &agg_info);
        }
    }
}

fn get_agg_wip<'a>(
    agg_wips: &'a mut HashMap<FlowKey, AggWip>,
    get_agg_flow: fn(&FlowMarker) -> FlowMarker,
    child: &FlowMarker,
) -> &'a mut AggWip {
    let parent = get_agg_flow(child);
    agg_wips
        .entry(FlowKey::from(&parent))
        .or_insert_with(|| AggWip {
            state: crate::state::AggState::new(parent, false),
            oldest_active: None,
            newest_dead: None,
            cum_hipri_usage_bytes: 0,
            cum_lopri_usage_bytes: 0,
            sum_ewma_usage_bps: 0,
            children: Vec::new(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_alg::demand::BweDemandPredictor;
    use heyp_proto::Timestamp;

    fn host_flow(src_dc: &str, dst_dc: &str, host_id: u64) -> FlowMarker {
        FlowMarker {
            src_dc: src_dc.into(),
            dst_dc: dst_dc.into(),
            job: "app".into(),
            host_id,
            ..Default::default()
        }
    }

    fn bundle(host_id: u64, time_sec: i64, infos: Vec<FlowInfo>) -> InfoBundle {
        InfoBundle {
            bundler: Some(FlowMarker {
                host_id,
                ..Default::default()
            }),
            timestamp: Some(Timestamp {
                seconds: time_sec,
                nanos: 0,
            }),
            flow_infos: infos,
            gen: 0,
        }
    }

    fn info(flow: FlowMarker, ewma: i64, cum_hipri: i64, cum_lopri: i64) -> FlowInfo {
        FlowInfo {
            flow: Some(flow),
            ewma_usage_bps: ewma,
            cum_usage_bytes: cum_hipri + cum_lopri,
            cum_hipri_usage_bytes: cum_hipri,
            cum_lopri_usage_bytes: cum_lopri,
            ..Default::default()
        }
    }

    fn new_aggregator() -> FlowAggregator {
        FlowAggregator::new_host_to_cluster(
            Box::new(BweDemandPredictor::new(Duration::seconds(120), 1.0, 0)),
            Duration::seconds(120),
        )
    }

    #[test]
    fn aggregates_across_bundlers() {
        let agg = new_aggregator();
        agg.update(&bundle(
            1,
            1,
            vec![info(host_flow("chi", "det", 1), 100, 1000, 0)],
        ));
        agg.update(&bundle(
            2,
            1,
            vec![
                info(host_flow("chi", "det", 2), 200, 500, 500),
                info(host_flow("chi", "nyc", 2), 50, 10, 0),
            ],
        ));

        let mut seen = HashMap::new();
        agg.for_each_agg(|_, agg_info| {
            let _ = seen.insert(agg_info.parent.flow().dst_dc.clone(), agg_info.clone());
        });
        assert_eq!(seen.len(), 2);

        let det = &seen["det"];
        assert_eq!(det.children.len(), 2);
        assert_eq!(det.parent.ewma_usage_bps, 300);
        assert_eq!(det.parent.cum_hipri_usage_bytes, 1500);
        assert_eq!(det.parent.cum_lopri_usage_bytes, 500);

        let nyc = &seen["nyc"];
        assert_eq!(nyc.children.len(), 1);
        assert_eq!(nyc.parent.ewma_usage_bps, 50);
    }

    #[test]
    fn stale_children_move_to_dead_but_keep_bytes() {
        let agg = new_aggregator();
        agg.update(&bundle(
            1,
            0,
            vec![info(host_flow("chi", "det", 1), 100, 1000, 0)],
        ));
        // Much later, the same bundler reports a different host-flow; the
        // old one is past the staleness window.
        agg.update(&bundle(
            1,
            500,
            vec![info(host_flow("chi", "nyc", 1), 10, 50, 0)],
        ));

        let mut seen = HashMap::new();
        agg.for_each_agg(|_, agg_info| {
            let _ = seen.insert(agg_info.parent.flow().dst_dc.clone(), agg_info.clone());
        });

        let det = &seen["det"];
        assert!(det.children.is_empty());
        assert_eq!(det.parent.cum_hipri_usage_bytes, 1000);
    }

    #[test]
    fn invalid_children_are_dropped() {
        let agg = new_aggregator();
        // Missing host_id: not a valid host-flow.
        agg.update(&bundle(
            1,
            1,
            vec![info(
                FlowMarker {
                    src_dc: "chi".into(),
                    dst_dc: "det".into(),
                    ..Default::default()
                },
                100,
                0,
                0,
            )],
        ));
        let mut count = 0;
        agg.for_each_agg(|_, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn removed_bundler_disappears() {
        let agg = new_aggregator();
        let b = bundle(1, 1, vec![info(host_flow("chi", "det", 1), 100, 0, 0)]);
        agg.update(&b);
        agg.remove(b.bundler());
        let mut count = 0;
        agg.for_each_agg(|_, _| count += 1);
        assert_eq!(count, 0);
    }
}
