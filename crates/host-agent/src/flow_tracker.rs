// SPDX-License-Identifier: Apache-2.0

//! Tracks the state of this host's outbound flows.
//!
//! Flows are keyed by their marker as reported by the socket inspector
//! (without a seqnum); the tracker assigns each new flow a monotonically
//! increasing seqnum so reused 4-tuples stay distinguishable. A flow whose
//! cumulative byte counter regresses must be a new connection on the same
//! tuple: the old state is finalized and a fresh one is started.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use heyp_alg::demand::DemandPredictor;
use heyp_common::TimedMutex;
use heyp_flows::state::{LeafState, LeafUpdate};
use heyp_proto::marker::FlowKey;
use heyp_proto::{AuxInfo, FlowInfo, FlowMarker};
use tracing::{debug, info};

/// The priority a flow's bytes were observed to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FlowPri {
    /// Not known (e.g. final reports from closed sockets).
    #[default]
    Unset,
    /// High priority.
    Hi,
    /// Low priority.
    Lo,
}

/// One measurement for one flow.
#[derive(Clone, Debug, Default)]
pub struct Update {
    /// The flow, without a seqnum.
    pub flow: FlowMarker,
    /// Instantaneous send rate, zero when unknown.
    pub instantaneous_usage_bps: i64,
    /// Cumulative bytes sent.
    pub cum_usage_bytes: i64,
    /// The priority used since the last measurement.
    pub used_priority: FlowPri,
    /// Optional TCP statistics.
    pub aux: Option<AuxInfo>,
}

/// Configuration for [`FlowTracker`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// History window handed to the flow states.
    pub usage_history_window: Duration,
    /// Drop the inspector's instantaneous rate and use byte deltas only.
    pub ignore_instantaneous_usage: bool,
}

struct Inner {
    active: HashMap<FlowKey, LeafState>,
    done: Vec<LeafState>,
    next_seqnum: u64,
}

/// See the module docs.
pub struct FlowTracker {
    config: Config,
    demand_predictor: Box<dyn DemandPredictor>,
    mu: TimedMutex<Inner>,
}

const LONG_LOCK: std::time::Duration = std::time::Duration::from_secs(1);

fn create_leaf_state(flow: &FlowMarker, seqnum: u64) -> LeafState {
    let mut flow = flow.clone();
    flow.seqnum = seqnum;
    LeafState::new(flow)
}

impl FlowTracker {
    /// Creates a tracker.
    pub fn new(demand_predictor: Box<dyn DemandPredictor>, config: Config) -> Self {
        Self {
            config,
            demand_predictor,
            mu: TimedMutex::new(Inner {
                active: HashMap::new(),
                done: Vec::new(),
                next_seqnum: 0,
            }),
        }
    }

    /// Calls `func` on every active flow.
    pub fn for_each_active_flow(&self, mut func: impl FnMut(Option<DateTime<Utc>>, &FlowInfo)) {
        let inner = self.mu.lock_warn_long(LONG_LOCK, "flow-tracker");
        for state in inner.active.values() {
            func(state.updated_time(), state.cur());
        }
    }

    /// Removes and returns the flows that finished since the last call, so
    /// they can be reported one final time.
    pub fn take_done_flows(&self) -> Vec<FlowInfo> {
        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-tracker");
        inner.done.drain(..).map(|s| s.cur().clone()).collect()
    }

    /// Applies a batch of measurements for open sockets.
    pub fn update_flows(&self, timestamp: DateTime<Utc>, flow_update_batch: &[Update]) {
        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-tracker");
        let mut i = 0;
        while i < flow_update_batch.len() {
            let u = &flow_update_batch[i];
            let key = FlowKey::from(&u.flow);
            if !inner.active.contains_key(&key) {
                info!(flow = ?u.flow, "new active flow");
                inner.next_seqnum += 1;
                let seqnum = inner.next_seqnum;
                let _ = inner
                    .active
                    .insert(key.clone(), create_leaf_state(&u.flow, seqnum));
            }
            let state = inner.active.get_mut(&key).expect("just inserted");
            if state.cur().cum_usage_bytes > u.cum_usage_bytes {
                // Usage went backwards, so the tuple must have been reused by
                // a new connection. Finalize the old flow and rerun this
                // update to insert a new state.
                let state = inner.active.remove(&key).expect("present");
                inner.done.push(state);
                continue;
            }
            debug_assert!(u.used_priority != FlowPri::Unset);
            let mut update = LeafUpdate {
                time: timestamp,
                cum_usage_bytes: u.cum_usage_bytes,
                instantaneous_usage_bps: u.instantaneous_usage_bps,
                is_lopri: u.used_priority == FlowPri::Lo,
                aux: u.aux.clone(),
            };
            if self.config.ignore_instantaneous_usage {
                update.instantaneous_usage_bps = 0;
            }
            state.update_usage(
                update,
                self.config.usage_history_window,
                self.demand_predictor.as_ref(),
            );
            i += 1;
        }
    }

    /// Applies final measurements for closed sockets and moves the flows to
    /// the done list.
    pub fn finalize_flows(&self, timestamp: DateTime<Utc>, flow_update_batch: &[Update]) {
        let mut inner = self.mu.lock_warn_long(LONG_LOCK, "flow-tracker");
        for u in flow_update_batch {
            let key = FlowKey::from(&u.flow);
            if !inner.active.contains_key(&key) {
                debug!(flow = ?u.flow, "finalizing unseen flow");
                inner.next_seqnum += 1;
                let seqnum = inner.next_seqnum;
                let _ = inner
                    .active
                    .insert(key.clone(), create_leaf_state(&u.flow, seqnum));
            }
            let state = inner.active.get_mut(&key).expect("just inserted");
            let is_lopri = match u.used_priority {
                FlowPri::Lo => true,
                FlowPri::Hi => false,
                FlowPri::Unset => state.cur().currently_lopri,
            };
            let mut update = LeafUpdate {
                time: timestamp,
                cum_usage_bytes: u.cum_usage_bytes,
                instantaneous_usage_bps: u.instantaneous_usage_bps,
                is_lopri,
                aux: u.aux.clone(),
            };
            if self.config.ignore_instantaneous_usage {
                update.instantaneous_usage_bps = 0;
            }
            state.update_usage(
                update,
                self.config.usage_history_window,
                self.demand_predictor.as_ref(),
            );
            info!(flow = ?u.flow, "moving flow from active to done");
            let state = inner.active.remove(&key).expect("present");
            inner.done.push(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_alg::demand::BweDemandPredictor;

    fn tracker() -> FlowTracker {
        FlowTracker::new(
            Box::new(BweDemandPredictor::new(Duration::seconds(60), 1.0, 0)),
            Config {
                usage_history_window: Duration::seconds(120),
                ignore_instantaneous_usage: false,
            },
        )
    }

    fn flow(src_port: i32) -> FlowMarker {
        FlowMarker {
            host_id: 1,
            src_addr: "10.0.0.1".into(),
            dst_addr: "10.1.0.1".into(),
            protocol: heyp_proto::Protocol::ProtoTcp as i32,
            src_port,
            dst_port: 443,
            ..Default::default()
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    fn update(src_port: i32, bytes: i64) -> Update {
        Update {
            flow: flow(src_port),
            cum_usage_bytes: bytes,
            used_priority: FlowPri::Hi,
            ..Default::default()
        }
    }

    #[test]
    fn assigns_increasing_seqnums() {
        let tr = tracker();
        tr.update_flows(t(0), &[update(1000, 10), update(1001, 10)]);
        let mut seqnums = Vec::new();
        tr.for_each_active_flow(|_, info| seqnums.push(info.flow().seqnum));
        seqnums.sort_unstable();
        assert_eq!(seqnums, vec![1, 2]);
    }

    #[test]
    fn usage_regression_starts_a_new_flow() {
        let tr = tracker();
        tr.update_flows(t(0), &[update(1000, 1000)]);
        tr.update_flows(t(1), &[update(1000, 2000)]);
        // The tuple was reused: counters restart from 50.
        tr.update_flows(t(2), &[update(1000, 50)]);

        let mut active = Vec::new();
        tr.for_each_active_flow(|_, info| active.push(info.clone()));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cum_usage_bytes, 50);
        assert_eq!(active[0].flow().seqnum, 2);

        let done = tr.take_done_flows();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].cum_usage_bytes, 2000);
        assert_eq!(done[0].flow().seqnum, 1);
        assert!(tr.take_done_flows().is_empty());
    }

    #[test]
    fn finalize_moves_to_done() {
        let tr = tracker();
        tr.update_flows(t(0), &[update(1000, 1000)]);
        tr.finalize_flows(
            t(1),
            &[Update {
                flow: flow(1000),
                cum_usage_bytes: 1500,
                used_priority: FlowPri::Unset,
                ..Default::default()
            }],
        );
        let mut active = 0;
        tr.for_each_active_flow(|_, _| active += 1);
        assert_eq!(active, 0);
        let done = tr.take_done_flows();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].cum_usage_bytes, 1500);
    }

    #[test]
    fn finalize_of_unseen_flow_creates_record() {
        let tr = tracker();
        tr.finalize_flows(
            t(0),
            &[Update {
                flow: flow(2000),
                cum_usage_bytes: 300,
                used_priority: FlowPri::Unset,
                ..Default::default()
            }],
        );
        let done = tr.take_done_flows();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].cum_usage_bytes, 300);
        assert_eq!(done[0].flow().seqnum, 1);
    }
}
