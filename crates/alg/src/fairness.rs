// SPDX-License-Identifier: Apache-2.0

//! Single-link max-min fair bandwidth allocation.
//!
//! Given a capacity and a set of demands, the waterlevel `w` is the largest
//! level such that `Σ min(dᵢ, w) = min(capacity, Σ dᵢ)`. The allocation for
//! demand `dᵢ` is `min(dᵢ, w)`. All arithmetic is integral; the waterlevel is
//! rounded down and any residual capacity is discarded.

/// How [`SingleLinkMaxMinFairnessProblem`] finds the waterlevel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SolveMethod {
    /// Sort all demands, then scan: O(n log n).
    FullSort,
    /// Recursive partitioning around medians: O(n) expected.
    #[default]
    PartialSort,
}

/// Options for [`SingleLinkMaxMinFairnessProblem`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleLinkMaxMinFairnessProblemOptions {
    /// Waterlevel computation strategy. Both strategies return identical
    /// results.
    pub solve_method: SolveMethod,
    /// Peels off demands that sit at or below the even share before solving.
    /// Such demands are always fully satisfied, so the result is unchanged.
    pub enable_tiny_flow_opt: bool,
}

/// Computes max-min fair allocations of a shared capacity.
///
/// The struct owns a scratch buffer so repeated solves do not allocate.
#[derive(Debug, Default)]
pub struct SingleLinkMaxMinFairnessProblem {
    options: SingleLinkMaxMinFairnessProblemOptions,
    scratch: Vec<i64>,
}

impl SingleLinkMaxMinFairnessProblem {
    /// Creates a solver with default options (partial sort, tiny-flow
    /// optimization on).
    pub fn new() -> Self {
        Self::with_options(SingleLinkMaxMinFairnessProblemOptions {
            solve_method: SolveMethod::PartialSort,
            enable_tiny_flow_opt: true,
        })
    }

    /// Creates a solver with explicit options.
    pub fn with_options(options: SingleLinkMaxMinFairnessProblemOptions) -> Self {
        Self {
            options,
            scratch: Vec::new(),
        }
    }

    /// Computes the max-min fair waterlevel.
    pub fn compute_waterlevel(&mut self, capacity: i64, demands: &[i64]) -> i64 {
        if demands.is_empty() {
            return 0;
        }
        let total: i64 = demands.iter().sum();
        let mut cap = capacity.clamp(0, total);

        self.scratch.clear();
        self.scratch.extend_from_slice(demands);

        let mut max_peeled = 0i64;
        if self.options.enable_tiny_flow_opt {
            // Demands at or below the even share are below every feasible
            // waterlevel, hence fully satisfied. Peeling them is exact.
            loop {
                let n = self.scratch.len() as i64;
                if n == 0 {
                    break;
                }
                let share = cap / n;
                let before = self.scratch.len();
                let mut removed_sum = 0i64;
                self.scratch.retain(|&d| {
                    if d <= share {
                        removed_sum += d;
                        max_peeled = max_peeled.max(d);
                        false
                    } else {
                        true
                    }
                });
                if self.scratch.len() == before {
                    break;
                }
                cap -= removed_sum;
            }
            if self.scratch.is_empty() {
                // Everything is satisfied; the waterlevel is the max demand.
                return max_peeled;
            }
        }

        match self.options.solve_method {
            SolveMethod::FullSort => {
                self.scratch.sort_unstable();
                waterlevel_scan(cap, &self.scratch, 0)
            }
            SolveMethod::PartialSort => {
                let mut scratch = std::mem::take(&mut self.scratch);
                let w = waterlevel_select(cap, &mut scratch, 0);
                self.scratch = scratch;
                w
            }
        }
    }

    /// Sets `allocations[i] = min(demands[i], waterlevel)`.
    pub fn set_allocations(&self, waterlevel: i64, demands: &[i64], allocations: &mut Vec<i64>) {
        allocations.clear();
        allocations.extend(demands.iter().map(|&d| d.min(waterlevel)));
    }
}

/// Scan over ascending demands. `n_above` counts demands already known to lie
/// above the waterlevel; each of them consumes one waterlevel's worth of
/// capacity.
///
/// The comparison is strict: a demand exactly at the (floored) even share is
/// still satisfiable, so the fill continues past it.
fn waterlevel_scan(cap: i64, sorted_asc: &[i64], n_above: i64) -> i64 {
    let n = sorted_asc.len() as i64;
    let mut rem = cap;
    for (i, &d) in sorted_asc.iter().enumerate() {
        let level = rem / (n - i as i64 + n_above);
        if d > level {
            return level;
        }
        rem -= d;
    }
    if n_above > 0 {
        rem / n_above
    } else {
        // Every demand is satisfied; the waterlevel is the max demand.
        *sorted_asc.last().unwrap_or(&0)
    }
}

/// Quickselect-based waterlevel with the same contract as
/// [`waterlevel_scan`].
fn waterlevel_select(cap: i64, demands: &mut [i64], n_above: i64) -> i64 {
    const SMALL: usize = 16;
    if demands.len() <= SMALL {
        demands.sort_unstable();
        return waterlevel_scan(cap, demands, n_above);
    }

    let mid = demands.len() / 2;
    let (lower, pivot, upper) = demands.select_nth_unstable(mid);
    let v = *pivot;
    let sum_lower: i64 = lower.iter().sum();
    let n_at_or_above_pivot = (upper.len() + 1) as i64;

    if sum_lower + (n_at_or_above_pivot + n_above) * v <= cap {
        // The waterlevel is at least the pivot: every demand below it is
        // fully satisfied and drops out of the problem.
        let (_, rest) = demands.split_at_mut(mid);
        waterlevel_select(cap - sum_lower, rest, n_above)
    } else {
        // The waterlevel is below the pivot: the pivot and everything above
        // it consume one waterlevel each.
        let (rest, _) = demands.split_at_mut(mid);
        waterlevel_select(cap, rest, n_above + n_at_or_above_pivot)
    }
}
