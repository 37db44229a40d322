// SPDX-License-Identifier: Apache-2.0

//! Knapsack downgrade: pick the subset of children whose summed volume best
//! approximates the target LOPRI demand without exceeding it.
//!
//! Volumes serve as both weight and value, so this is a subset-sum search.
//! Solved with branch-and-bound over children sorted by decreasing volume,
//! with a node budget as a backstop on pathological inputs.

use super::ChildFlowInfo;

const NODE_BUDGET: u64 = 1 << 20;

struct Search<'a> {
    volumes: &'a [i64],
    suffix_sums: Vec<i64>,
    capacity: i64,
    best: i64,
    best_mask: Vec<bool>,
    current: Vec<bool>,
    nodes_left: u64,
}

impl Search<'_> {
    fn dfs(&mut self, i: usize, cur: i64) {
        if cur > self.best {
            self.best = cur;
            self.best_mask.copy_from_slice(&self.current);
        }
        if i == self.volumes.len() || self.nodes_left == 0 {
            return;
        }
        self.nodes_left -= 1;
        // No completion of this branch can beat the incumbent.
        if cur + self.suffix_sums[i] <= self.best {
            return;
        }
        if cur + self.volumes[i] <= self.capacity {
            self.current[i] = true;
            self.dfs(i + 1, cur + self.volumes[i]);
            self.current[i] = false;
        }
        self.dfs(i + 1, cur);
    }
}

// Beyond this many children the exact search recurses too deep; a greedy
// fill is close enough at that scale.
const MAX_EXACT_CHILDREN: usize = 1024;

/// Returns the LOPRI bitmap whose summed volume is the best approximation of
/// `want_frac_lopri` of the total volume from below.
pub fn pick_lopri_children(children: &[ChildFlowInfo], want_frac_lopri: f64) -> Vec<bool> {
    let total: i64 = children.iter().map(|c| c.volume_bps).sum();
    let want_demand = (want_frac_lopri * total as f64) as i64;

    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(children[i].volume_bps));
    let volumes: Vec<i64> = order.iter().map(|&i| children[i].volume_bps).collect();

    if children.len() > MAX_EXACT_CHILDREN {
        let mut lopri = vec![false; children.len()];
        let mut cur = 0;
        for (pos, &i) in order.iter().enumerate() {
            if cur + volumes[pos] <= want_demand {
                cur += volumes[pos];
                lopri[i] = true;
            }
        }
        return lopri;
    }

    let mut suffix_sums = vec![0i64; volumes.len()];
    let mut acc = 0;
    for i in (0..volumes.len()).rev() {
        acc += volumes[i];
        suffix_sums[i] = acc;
    }

    let mut search = Search {
        volumes: &volumes,
        suffix_sums,
        capacity: want_demand,
        best: -1,
        best_mask: vec![false; volumes.len()],
        current: vec![false; volumes.len()],
        nodes_left: NODE_BUDGET,
    };
    search.dfs(0, 0);

    let mut lopri = vec![false; children.len()];
    for (pos, &i) in order.iter().enumerate() {
        lopri[i] = search.best_mask[pos];
    }
    lopri
}
