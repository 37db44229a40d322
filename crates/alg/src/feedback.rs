// SPDX-License-Identifier: Apache-2.0

//! Feedback control of the downgrade fraction.
//!
//! The fast controller has no per-child demand model, so it steers the LOPRI
//! fraction from observed aggregate usage: when HIPRI usage exceeds the
//! admission, the fraction grows; when HIPRI usage is under the admission
//! and traffic is still riding LOPRI, the fraction shrinks. Step sizes are
//! bounded so one noisy tick cannot swing the partition.

use serde::{Deserialize, Serialize};

fn default_max_inc_per_tick() -> f64 {
    0.05
}

fn default_max_dec_per_tick() -> f64 {
    0.20
}

fn default_prop_gain() -> f64 {
    0.5
}

/// Configuration for [`DowngradeFracController`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DowngradeFracControllerConfig {
    /// Upper bound on a single tick's increase of the downgrade fraction.
    pub max_inc_per_tick: f64,
    /// Upper bound on a single tick's decrease of the downgrade fraction.
    pub max_dec_per_tick: f64,
    /// Proportional gain applied to the relative HIPRI overage.
    pub prop_gain: f64,
}

impl Default for DowngradeFracControllerConfig {
    fn default() -> Self {
        Self {
            max_inc_per_tick: default_max_inc_per_tick(),
            max_dec_per_tick: default_max_dec_per_tick(),
            prop_gain: default_prop_gain(),
        }
    }
}

/// Proportional controller for the downgrade fraction.
#[derive(Clone, Copy, Debug)]
pub struct DowngradeFracController {
    config: DowngradeFracControllerConfig,
}

impl DowngradeFracController {
    /// Creates a controller.
    pub fn new(config: DowngradeFracControllerConfig) -> Self {
        Self { config }
    }

    /// Returns the signed adjustment to apply to the downgrade fraction.
    ///
    /// Inputs are the aggregate's EWMA HIPRI and LOPRI usage, the HIPRI
    /// admission, and the EWMA of the largest single-child usage. The result
    /// is monotone in the HIPRI usage: negative while HIPRI sits under the
    /// admission (traffic should move back up), non-negative otherwise.
    /// Positive steps are floored at one max-sized child's share of traffic
    /// so the loop makes progress, and both directions honor the configured
    /// per-tick bounds.
    pub fn traffic_frac_to_downgrade(
        &self,
        ewma_hipri_bps: f64,
        ewma_lopri_bps: f64,
        hipri_admission_bps: f64,
        ewma_max_child_usage_bps: f64,
    ) -> f64 {
        let total = ewma_hipri_bps + ewma_lopri_bps;
        if !(total > 0.0) {
            return 0.0;
        }
        let overage = (ewma_hipri_bps - hipri_admission_bps) / total;
        let mut delta = self.config.prop_gain * overage;
        if delta > 0.0 {
            let min_step = (ewma_max_child_usage_bps / total).min(self.config.max_inc_per_tick);
            delta = delta.max(min_step).min(self.config.max_inc_per_tick);
        } else {
            delta = delta.max(-self.config.max_dec_per_tick);
        }
        delta
    }
}
