// SPDX-License-Identifier: Apache-2.0

//! The HEYP-Sigcomm20 greedy downgrade selector.
//!
//! Starting from the current LOPRI membership, children are flipped one at a
//! time (largest demand first) toward whichever bin is short of its target,
//! skipping any flip that would overshoot. Flips are therefore incremental:
//! small changes in the target fraction move few children.

use super::ChildFlowInfo;

/// Arguments to [`greedy_assign_to_minimize_gap`].
pub struct GreedyAssignArgs<'a> {
    /// Summed demand of the children currently in the bin being grown.
    pub cur_demand: i64,
    /// Target summed demand for that bin.
    pub want_demand: i64,
    /// Child indices sorted by decreasing demand.
    pub children_sorted_by_dec_demand: &'a [usize],
    /// All children.
    pub children: &'a [ChildFlowInfo],
}

/// Greedily flips children into one bin to close the gap to `want_demand`.
///
/// `STATE_TO_INCREASE` is the LOPRI flag value of the bin being grown: `true`
/// grows the LOPRI bin, `false` grows HIPRI.
pub fn greedy_assign_to_minimize_gap<const STATE_TO_INCREASE: bool>(
    mut args: GreedyAssignArgs<'_>,
    lopri_children: &mut [bool],
) {
    for &child_i in args.children_sorted_by_dec_demand {
        if lopri_children[child_i] == STATE_TO_INCREASE {
            continue; // child already belongs to our bin, don't flip
        }
        let next_demand = args.cur_demand + args.children[child_i].volume_bps;
        if next_demand > args.want_demand {
            continue; // flipping child_i overshoots the goal
        }
        lopri_children[child_i] = STATE_TO_INCREASE;
        args.cur_demand = next_demand;
    }
}

/// Returns the LOPRI bitmap after greedily moving children toward the target
/// fraction.
pub fn pick_lopri_children(children: &[ChildFlowInfo], want_frac_lopri: f64) -> Vec<bool> {
    let mut lopri: Vec<bool> = children.iter().map(|c| c.currently_lopri).collect();

    let total: i64 = children.iter().map(|c| c.volume_bps).sum();
    let want_lopri = (want_frac_lopri * total as f64) as i64;
    let cur_lopri: i64 = children
        .iter()
        .filter(|c| c.currently_lopri)
        .map(|c| c.volume_bps)
        .sum();

    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(children[i].volume_bps));

    if cur_lopri < want_lopri {
        greedy_assign_to_minimize_gap::<true>(
            GreedyAssignArgs {
                cur_demand: cur_lopri,
                want_demand: want_lopri,
                children_sorted_by_dec_demand: &order,
                children,
            },
            &mut lopri,
        );
    } else {
        greedy_assign_to_minimize_gap::<false>(
            GreedyAssignArgs {
                cur_demand: total - cur_lopri,
                want_demand: total - want_lopri,
                children_sorted_by_dec_demand: &order,
                children,
            },
            &mut lopri,
        );
    }
    lopri
}
