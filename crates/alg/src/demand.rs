// SPDX-License-Identifier: Apache-2.0

//! Demand prediction from usage history.

use chrono::{DateTime, Duration, Utc};

/// One usage measurement: the EWMA rate observed at `time`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageHistoryEntry {
    /// When the measurement was taken.
    pub time: DateTime<Utc>,
    /// Smoothed usage in bits per second.
    pub bps: i64,
}

/// Predicts the demand of a flow from its usage history.
pub trait DemandPredictor: Send + Sync {
    /// Returns the predicted demand in bps given the history up to `now`.
    fn from_usage(&self, now: DateTime<Utc>, usage_history: &[UsageHistoryEntry]) -> i64;
}

/// The BwE-style predictor: the maximum usage inside a trailing window,
/// scaled by a multiplier and floored at a configured minimum.
#[derive(Clone, Debug)]
pub struct BweDemandPredictor {
    time_window: Duration,
    usage_multiplier: f64,
    min_demand_bps: i64,
}

impl BweDemandPredictor {
    /// Creates a predictor.
    ///
    /// `usage_multiplier` must be positive and `min_demand_bps` non-negative.
    pub fn new(time_window: Duration, usage_multiplier: f64, min_demand_bps: i64) -> Self {
        debug_assert!(usage_multiplier > 0.0);
        debug_assert!(min_demand_bps >= 0);
        Self {
            time_window,
            usage_multiplier,
            min_demand_bps,
        }
    }
}

impl DemandPredictor for BweDemandPredictor {
    fn from_usage(&self, now: DateTime<Utc>, usage_history: &[UsageHistoryEntry]) -> i64 {
        let mut max_usage_bps: f64 = 0.0;
        for entry in usage_history.iter().rev() {
            if entry.time >= now - self.time_window {
                max_usage_bps = max_usage_bps.max(entry.bps as f64);
            }
        }

        let est = max_usage_bps * self.usage_multiplier;
        if est > self.min_demand_bps as f64 {
            est as i64
        } else {
            self.min_demand_bps
        }
    }
}
