// SPDX-License-Identifier: Apache-2.0

//! Algorithmic primitives shared by the HEYP host- and cluster-agents:
//! demand prediction, max-min fair allocation, threshold sampling, downgrade
//! selection, and the feedback controller that steers the downgrade fraction.

pub mod demand;
pub mod downgrade;
pub mod fairness;
pub mod feedback;
pub mod rate_limits;
pub mod sampler;

pub use demand::{BweDemandPredictor, DemandPredictor, UsageHistoryEntry};
pub use fairness::{SingleLinkMaxMinFairnessProblem, SingleLinkMaxMinFairnessProblemOptions};
pub use sampler::ThresholdSampler;
