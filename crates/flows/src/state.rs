// SPDX-License-Identifier: Apache-2.0

//! Per-flow measurement state.
//!
//! [`AggState`] ingests cumulative byte counters (already split by
//! priority), maintains an EWMA of the usage rate and a bounded history of
//! (time, rate) samples, and re-runs the demand predictor after every
//! update. [`LeafState`] wraps it for host-level flows where the byte
//! counter is a single cumulative total attributed to one priority at a
//! time.

use chrono::{DateTime, Duration, Utc};
use heyp_alg::demand::{DemandPredictor, UsageHistoryEntry};
use heyp_proto::{AuxInfo, FlowInfo, FlowMarker};
use tracing::warn;

const EWMA_ALPHA: f64 = 0.3;

/// An update for an aggregate flow.
#[derive(Clone, Debug, Default)]
pub struct AggUpdate {
    /// Measurement time.
    pub time: DateTime<Utc>,
    /// Sum of the children's instantaneous usage, in bps. Optional; zero
    /// means unknown.
    pub sum_child_usage_bps: i64,
    /// Cumulative bytes sent at HIPRI.
    pub cum_hipri_usage_bytes: i64,
    /// Cumulative bytes sent at LOPRI.
    pub cum_lopri_usage_bytes: i64,
    /// Optional TCP statistics.
    pub aux: Option<AuxInfo>,
}

/// Measurement state of one aggregate flow.
#[derive(Clone, Debug)]
pub struct AggState {
    cur: FlowInfo,
    usage_history: Vec<UsageHistoryEntry>,
    updated_time: Option<DateTime<Utc>>,
    smooth_usage: bool,
    was_updated: bool,
    have_bps: bool,
}

impl AggState {
    /// Creates state for `flow`. With `smooth_usage`, measured rates are
    /// blended into an EWMA; without it each measurement replaces the rate.
    pub fn new(flow: FlowMarker, smooth_usage: bool) -> Self {
        Self {
            cur: FlowInfo {
                flow: Some(flow),
                ..Default::default()
            },
            usage_history: Vec::new(),
            updated_time: None,
            smooth_usage,
            was_updated: false,
            have_bps: false,
        }
    }

    /// The flow this state describes.
    pub fn flow(&self) -> &FlowMarker {
        self.cur.flow()
    }

    /// Time of the most recent accepted update.
    pub fn updated_time(&self) -> Option<DateTime<Utc>> {
        self.updated_time
    }

    /// The current measurement snapshot.
    pub fn cur(&self) -> &FlowInfo {
        &self.cur
    }

    /// Applies one update.
    ///
    /// Updates older than the last accepted one are dropped with a warning,
    /// as are updates whose cumulative counters regress. `currently_lopri`
    /// flips on when LOPRI bytes grew while HIPRI bytes did not.
    pub fn update_usage(
        &mut self,
        u: AggUpdate,
        usage_history_window: Duration,
        demand_predictor: &dyn DemandPredictor,
    ) {
        let cum_usage_bytes = u.cum_hipri_usage_bytes + u.cum_lopri_usage_bytes;
        let is_lopri = u.cum_hipri_usage_bytes == self.cur.cum_hipri_usage_bytes
            && u.cum_lopri_usage_bytes > self.cur.cum_lopri_usage_bytes;

        if let Some(updated_time) = self.updated_time {
            if u.time < updated_time {
                warn!(
                    flow = ?self.cur.flow(),
                    update_time = %u.time,
                    last_time = %updated_time,
                    "got update older than last update"
                );
                return;
            }
        }
        if u.cum_hipri_usage_bytes < self.cur.cum_hipri_usage_bytes
            || u.cum_lopri_usage_bytes < self.cur.cum_lopri_usage_bytes
        {
            warn!(
                flow = ?self.cur.flow(),
                "cumulative usage went backwards; dropping update"
            );
            return;
        }

        let mut measured_usage_bps = u.sum_child_usage_bps as f64;

        if self.was_updated {
            let usage_bits = 8 * (cum_usage_bytes - self.cur.cum_usage_bytes);
            if let Some(updated_time) = self.updated_time {
                let dur = u.time - updated_time;
                if dur > Duration::zero() {
                    let secs = dur.num_nanoseconds().unwrap_or(i64::MAX) as f64 / 1e9;
                    let measured_mean_usage_bps = usage_bits as f64 / secs;
                    measured_usage_bps = measured_usage_bps.max(measured_mean_usage_bps);
                }
            }
        } else {
            self.was_updated = true;
            self.updated_time = Some(u.time);
            self.cur.currently_lopri = is_lopri;
            self.cur.cum_usage_bytes = cum_usage_bytes;
            self.cur.cum_hipri_usage_bytes = u.cum_hipri_usage_bytes;
            self.cur.cum_lopri_usage_bytes = u.cum_lopri_usage_bytes;
            if let Some(ref aux) = u.aux {
                self.cur.aux = Some(aux.clone());
            }
            if measured_usage_bps == 0.0 {
                return; // likely no usage data yet, wait to estimate usage
            }
        }

        if !self.have_bps || !self.smooth_usage {
            self.cur.ewma_usage_bps = measured_usage_bps as i64;
            self.have_bps = true;
        } else {
            self.cur.ewma_usage_bps = (EWMA_ALPHA * measured_usage_bps
                + (1.0 - EWMA_ALPHA) * self.cur.ewma_usage_bps as f64)
                as i64;
        }

        self.updated_time = Some(u.time);
        self.cur.currently_lopri = is_lopri;
        self.cur.cum_usage_bytes = cum_usage_bytes;
        self.cur.cum_hipri_usage_bytes = u.cum_hipri_usage_bytes;
        self.cur.cum_lopri_usage_bytes = u.cum_lopri_usage_bytes;
        if let Some(aux) = u.aux {
            self.cur.aux = Some(aux);
        }

        self.usage_history.push(UsageHistoryEntry {
            time: u.time,
            bps: self.cur.ewma_usage_bps,
        });

        // Garbage collect old entries, but allow some delay.
        if let Some(front) = self.usage_history.first() {
            if u.time - front.time > usage_history_window * 2 {
                let min_time = u.time - usage_history_window;
                self.usage_history.retain(|e| e.time >= min_time);
            }
        }

        self.cur.predicted_demand_bps =
            demand_predictor.from_usage(u.time, &self.usage_history);
    }
}

/// An update for a leaf (host-level) flow.
#[derive(Clone, Debug, Default)]
pub struct LeafUpdate {
    /// Measurement time.
    pub time: DateTime<Utc>,
    /// Cumulative bytes sent on this flow.
    pub cum_usage_bytes: i64,
    /// Instantaneous send rate in bps. Optional; zero means unknown.
    pub instantaneous_usage_bps: i64,
    /// Whether the bytes since the last update were sent at LOPRI.
    pub is_lopri: bool,
    /// Optional TCP statistics.
    pub aux: Option<AuxInfo>,
}

/// Measurement state of one leaf flow. Leaf usage is EWMA-smoothed.
#[derive(Clone, Debug)]
pub struct LeafState {
    inner: AggState,
}

impl LeafState {
    /// Creates state for `flow`.
    pub fn new(flow: FlowMarker) -> Self {
        Self {
            inner: AggState::new(flow, true),
        }
    }

    /// The flow this state describes.
    pub fn flow(&self) -> &FlowMarker {
        self.inner.flow()
    }

    /// Time of the most recent accepted update.
    pub fn updated_time(&self) -> Option<DateTime<Utc>> {
        self.inner.updated_time()
    }

    /// The current measurement snapshot.
    pub fn cur(&self) -> &FlowInfo {
        &self.inner.cur
    }

    /// Applies one update, attributing the new bytes to the priority the
    /// flow currently uses.
    pub fn update_usage(
        &mut self,
        u: LeafUpdate,
        usage_history_window: Duration,
        demand_predictor: &dyn DemandPredictor,
    ) {
        let cur = &self.inner.cur;
        let byte_diff = u.cum_usage_bytes - cur.cum_usage_bytes;
        let mut cum_hipri_usage_bytes = cur.cum_hipri_usage_bytes;
        let mut cum_lopri_usage_bytes = cur.cum_lopri_usage_bytes;
        if u.is_lopri {
            cum_lopri_usage_bytes += byte_diff;
        } else {
            cum_hipri_usage_bytes += byte_diff;
        }

        self.inner.update_usage(
            AggUpdate {
                time: u.time,
                sum_child_usage_bps: u.instantaneous_usage_bps,
                cum_hipri_usage_bytes,
                cum_lopri_usage_bytes,
                aux: u.aux,
            },
            usage_history_window,
            demand_predictor,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heyp_alg::demand::BweDemandPredictor;

    fn marker() -> FlowMarker {
        FlowMarker {
            src_dc: "a".into(),
            dst_dc: "b".into(),
            host_id: 1,
            ..Default::default()
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn tracks_usage_and_demand() {
        let predictor = BweDemandPredictor::new(Duration::seconds(60), 1.1, 0);
        let mut state = LeafState::new(marker());

        state.update_usage(
            LeafUpdate {
                time: t(0),
                cum_usage_bytes: 0,
                ..Default::default()
            },
            Duration::seconds(120),
            &predictor,
        );
        // 1000 bytes over 1s: 8000 bps.
        state.update_usage(
            LeafUpdate {
                time: t(1),
                cum_usage_bytes: 1000,
                ..Default::default()
            },
            Duration::seconds(120),
            &predictor,
        );
        assert_eq!(state.cur().ewma_usage_bps, 8000);
        assert_eq!(state.cur().cum_usage_bytes, 1000);
        assert_eq!(state.cur().cum_hipri_usage_bytes, 1000);
        assert_eq!(state.cur().predicted_demand_bps, 8800);

        // Another 1000 bytes over 1s: EWMA moves toward 8000 from 8000.
        state.update_usage(
            LeafUpdate {
                time: t(2),
                cum_usage_bytes: 2000,
                is_lopri: true,
                ..Default::default()
            },
            Duration::seconds(120),
            &predictor,
        );
        assert_eq!(state.cur().ewma_usage_bps, 8000);
        assert_eq!(state.cur().cum_lopri_usage_bytes, 1000);
        assert!(state.cur().currently_lopri);
    }

    #[test]
    fn invariant_cum_usage_is_sum_of_priorities() {
        let predictor = BweDemandPredictor::new(Duration::seconds(60), 1.0, 0);
        let mut state = LeafState::new(marker());
        let window = Duration::seconds(120);
        for (i, (bytes, lopri)) in [(100, false), (250, false), (700, true), (900, true)]
            .iter()
            .enumerate()
        {
            state.update_usage(
                LeafUpdate {
                    time: t(i as i64),
                    cum_usage_bytes: *bytes,
                    is_lopri: *lopri,
                    ..Default::default()
                },
                window,
                &predictor,
            );
            let cur = state.cur();
            assert_eq!(
                cur.cum_usage_bytes,
                cur.cum_hipri_usage_bytes + cur.cum_lopri_usage_bytes
            );
        }
    }

    #[test]
    fn drops_out_of_order_updates() {
        let predictor = BweDemandPredictor::new(Duration::seconds(60), 1.0, 0);
        let mut state = LeafState::new(marker());
        let window = Duration::seconds(120);
        state.update_usage(
            LeafUpdate {
                time: t(10),
                cum_usage_bytes: 500,
                ..Default::default()
            },
            window,
            &predictor,
        );
        state.update_usage(
            LeafUpdate {
                time: t(5),
                cum_usage_bytes: 600,
                ..Default::default()
            },
            window,
            &predictor,
        );
        assert_eq!(state.cur().cum_usage_bytes, 500);
        assert_eq!(state.updated_time(), Some(t(10)));
    }

    #[test]
    fn history_is_sorted_and_pruned() {
        let predictor = BweDemandPredictor::new(Duration::seconds(5), 1.0, 0);
        let window = Duration::seconds(5);
        let mut state = AggState::new(marker(), false);
        for i in 0..30 {
            state.update_usage(
                AggUpdate {
                    time: t(i),
                    sum_child_usage_bps: 100 + i,
                    ..Default::default()
                },
                window,
                &predictor,
            );
        }
        let history = &state.usage_history;
        assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
        // Lazy GC keeps at most 2x the window.
        let span = history.last().unwrap().time - history.first().unwrap().time;
        assert!(span <= window * 2);
        // Demand reflects the in-window max (plus the current sample).
        assert_eq!(state.cur().predicted_demand_bps, 129);
    }

    #[test]
    fn first_sample_without_rate_waits() {
        let predictor = BweDemandPredictor::new(Duration::seconds(60), 2.0, 0);
        let mut state = AggState::new(marker(), true);
        state.update_usage(
            AggUpdate {
                time: t(0),
                sum_child_usage_bps: 0,
                cum_hipri_usage_bytes: 1000,
                ..Default::default()
            },
            Duration::seconds(120),
            &predictor,
        );
        // No rate estimate yet; usage and demand stay unset.
        assert_eq!(state.cur().ewma_usage_bps, 0);
        assert_eq!(state.cur().predicted_demand_bps, 0);
        assert_eq!(state.cur().cum_usage_bytes, 1000);
    }
}
