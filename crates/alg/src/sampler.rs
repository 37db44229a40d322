// SPDX-License-Identifier: Apache-2.0

//! Threshold sampling for estimating aggregate usage from a subset of hosts.
//!
//! A host reporting usage `u` is included with probability
//! `min(u * N / A, 1)` where `N` is the target sample count at approval `A`.
//! Estimators reweight each sample by its inclusion probability
//! (Horvitz-Thompson), which keeps the aggregate estimate unbiased.

use std::collections::HashMap;

use rand::Rng;

/// A usage value together with its reweighted expected count.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ValCount {
    /// The sampled usage value.
    pub val: f64,
    /// The expected number of hosts reporting this value.
    pub expected_count: f64,
}

/// Inclusion-probability sampler.
#[derive(Clone, Copy, Debug)]
pub struct ThresholdSampler {
    approval: f64,
    thresh: f64,
}

fn sampling_prob_of(approval: f64, thresh: f64, usage: f64) -> f64 {
    if approval == 0.0 {
        return 1.0;
    }
    (usage * thresh).min(1.0)
}

impl ThresholdSampler {
    /// Creates a sampler that aims for `num_samples_at_approval` samples when
    /// the aggregate usage is `approval`.
    pub fn new(num_samples_at_approval: f64, approval: f64) -> Self {
        Self {
            approval,
            thresh: num_samples_at_approval / approval,
        }
    }

    /// Whether a host with the given usage should be included this round.
    pub fn should_include<R: Rng + ?Sized>(&self, rng: &mut R, usage: f64) -> bool {
        let prob = sampling_prob_of(self.approval, self.thresh, usage);
        rng.random_range(0.0..1.0) < prob
    }

    /// Creates an estimator for the aggregate usage of the sampled hosts.
    pub fn new_agg_usage_estimator(&self) -> AggUsageEstimator {
        AggUsageEstimator {
            approval: self.approval,
            thresh: self.thresh,
            est: 0.0,
        }
    }

    /// Creates an estimator for the distribution of sampled usage values.
    pub fn new_usage_dist_estimator(&self) -> UsageDistEstimator {
        UsageDistEstimator {
            approval: self.approval,
            thresh: self.thresh,
            counts: HashMap::new(),
        }
    }
}

/// Horvitz-Thompson estimator of the aggregate usage.
#[derive(Clone, Debug)]
pub struct AggUsageEstimator {
    approval: f64,
    thresh: f64,
    est: f64,
}

impl AggUsageEstimator {
    /// Records one sampled usage value. Zero-usage samples carry no weight
    /// and are skipped.
    pub fn record_sample(&mut self, usage: f64) {
        let p = sampling_prob_of(self.approval, self.thresh, usage);
        if p > 0.0 {
            self.est += usage / p;
        }
    }

    /// Returns the usage estimate.
    pub fn est_usage(&self) -> f64 {
        self.est
    }
}

/// Horvitz-Thompson estimator of the usage distribution.
#[derive(Clone, Debug)]
pub struct UsageDistEstimator {
    approval: f64,
    thresh: f64,
    counts: HashMap<u64, (f64, i64)>,
}

impl UsageDistEstimator {
    /// Records one sampled usage value.
    pub fn record_sample(&mut self, usage: f64) {
        let entry = self.counts.entry(usage.to_bits()).or_insert((usage, 0));
        entry.1 += 1;
    }

    /// Returns the reweighted distribution of sampled values.
    pub fn est_dist(&self) -> Vec<ValCount> {
        let mut dist: Vec<ValCount> = self
            .counts
            .values()
            .map(|&(usage, count)| {
                let p = sampling_prob_of(self.approval, self.thresh, usage);
                ValCount {
                    val: usage,
                    expected_count: if p > 0.0 { count as f64 / p } else { 0.0 },
                }
            })
            .collect();
        dist.sort_by(|a, b| a.val.total_cmp(&b.val));
        dist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn half_probability() {
        let sampler = ThresholdSampler::new(100.0, 100.0);
        let mut rng = StdRng::seed_from_u64(1);
        let mut c = 0;
        for _ in 0..1000 {
            if sampler.should_include(&mut rng, 0.5) {
                c += 1;
            }
        }
        assert!((450..=550).contains(&c), "c = {c}");
    }

    #[test]
    fn zero_approval_includes_everything() {
        let sampler = ThresholdSampler::new(101.0, 0.0);
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..100 {
            assert!(sampler.should_include(&mut rng, 0.0));
        }
    }

    struct RunResult {
        got_num_samples: f64,
        actual_usage: f64,
        est_usage: f64,
    }

    fn run_once(
        rng: &mut StdRng,
        sampler: &ThresholdSampler,
        approval: f64,
        usage_scale: f64,
    ) -> RunResult {
        const NUM_HOSTS: usize = 1030;
        let mut run = RunResult {
            got_num_samples: 0.0,
            actual_usage: 0.0,
            est_usage: 0.0,
        };
        let mut est = sampler.new_agg_usage_estimator();
        for _ in 0..NUM_HOSTS {
            let usage = usage_scale * rng.random_range(0.0..1.0) * approval / NUM_HOSTS as f64;
            run.actual_usage += usage;
            if sampler.should_include(rng, usage) {
                est.record_sample(usage);
                run.got_num_samples += 1.0;
            }
        }
        run.est_usage = est.est_usage();
        run
    }

    fn cases() -> Vec<(f64, f64)> {
        // (approval, num_samples_at_approval)
        vec![(1.0, 500.0), (3333.0, 100.0), (7777.0, 300.0)]
    }

    #[test]
    fn at_approval() {
        // Aggregate usage fluctuates around the approval. Per-run errors stay
        // moderate; errors averaged over many runs are small.
        for (approval, num_samples) in cases() {
            let sampler = ThresholdSampler::new(num_samples, approval);
            let mut rng = StdRng::seed_from_u64(0xa11);
            let mut avg_num_samples = 0.0;
            let mut avg_usage_error = 0.0;
            const NUM_RUNS: usize = 100;
            for _ in 0..NUM_RUNS {
                let run = run_once(&mut rng, &sampler, approval, 2.0);
                assert!((run.got_num_samples - num_samples).abs() <= num_samples * 0.5);
                assert!((run.est_usage - run.actual_usage).abs() <= run.actual_usage * 0.5);
                avg_num_samples += run.got_num_samples;
                avg_usage_error += (run.actual_usage - run.est_usage) / run.actual_usage;
            }
            avg_num_samples /= NUM_RUNS as f64;
            avg_usage_error /= NUM_RUNS as f64;
            assert!((avg_num_samples - num_samples).abs() <= num_samples * 0.05);
            assert!(avg_usage_error.abs() <= 0.05);
        }
    }

    #[test]
    fn above_approval() {
        for (approval, num_samples) in cases() {
            let sampler = ThresholdSampler::new(num_samples, approval);
            let mut rng = StdRng::seed_from_u64(0xab0);
            let mut avg_num_samples = 0.0;
            const NUM_RUNS: usize = 100;
            for _ in 0..NUM_RUNS {
                let run = run_once(&mut rng, &sampler, approval, 4.0);
                assert!(run.got_num_samples >= 0.8 * num_samples);
                assert!((run.est_usage - run.actual_usage).abs() <= run.actual_usage * 0.5);
                avg_num_samples += run.got_num_samples;
            }
            avg_num_samples /= NUM_RUNS as f64;
            assert!(avg_num_samples >= num_samples);
        }
    }

    #[test]
    fn below_approval() {
        for (approval, num_samples) in cases() {
            let sampler = ThresholdSampler::new(num_samples, approval);
            let mut rng = StdRng::seed_from_u64(0xbe1);
            let mut avg_num_samples = 0.0;
            const NUM_RUNS: usize = 100;
            for _ in 0..NUM_RUNS {
                let run = run_once(&mut rng, &sampler, approval, 1.0);
                assert!(run.got_num_samples <= 1.2 * num_samples);
                avg_num_samples += run.got_num_samples;
            }
            avg_num_samples /= NUM_RUNS as f64;
            assert!(avg_num_samples <= num_samples);
        }
    }

    #[test]
    fn dist_estimator_reweights_counts() {
        let sampler = ThresholdSampler::new(10.0, 100.0);
        let mut est = sampler.new_usage_dist_estimator();
        // p(5) = min(5 * 10/100, 1) = 0.5, so one sample counts double.
        est.record_sample(5.0);
        est.record_sample(20.0); // p = 1
        est.record_sample(20.0);
        let dist = est.est_dist();
        assert_eq!(dist.len(), 2);
        assert!((dist[0].val - 5.0).abs() < 1e-9);
        assert!((dist[0].expected_count - 2.0).abs() < 1e-9);
        assert!((dist[1].val - 20.0).abs() < 1e-9);
        assert!((dist[1].expected_count - 2.0).abs() < 1e-9);
    }
}
