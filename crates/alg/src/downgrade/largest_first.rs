// SPDX-License-Identifier: Apache-2.0

//! Largest-first downgrade: sort children by decreasing volume and mark the
//! smallest prefix whose cumulative volume reaches the target.

use super::ChildFlowInfo;

/// Marks the smallest largest-first prefix with cumulative volume at least
/// `want_frac_lopri` of the total.
pub fn pick_lopri_children(children: &[ChildFlowInfo], want_frac_lopri: f64) -> Vec<bool> {
    let total: i64 = children.iter().map(|c| c.volume_bps).sum();
    let want = want_frac_lopri * total as f64;

    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(children[i].volume_bps));

    let mut lopri = vec![false; children.len()];
    let mut cum = 0.0;
    for i in order {
        if cum >= want {
            break;
        }
        lopri[i] = true;
        cum += children[i].volume_bps as f64;
    }
    lopri
}

#[cfg(test)]
mod tests {
    use super::super::tests::children_with_demands_and_pri;
    use super::*;

    #[test]
    fn directionality() {
        let children =
            children_with_demands_and_pri(&[(200, true), (100, false), (300, false), (100, true)]);

        let t = true;
        let f = false;
        assert_eq!(pick_lopri_children(&children, 0.28), vec![f, f, t, f]);
        assert_eq!(pick_lopri_children(&children, 0.58), vec![t, f, t, f]);
        assert_eq!(pick_lopri_children(&children, 0.71), vec![t, f, t, f]);
        // Any positive target pulls in at least the largest child.
        assert_eq!(pick_lopri_children(&children, 0.14), vec![f, f, t, f]);
    }

    #[test]
    fn flip_completely() {
        let children =
            children_with_demands_and_pri(&[(200, true), (100, false), (300, false), (100, true)]);

        let t = true;
        let f = false;
        assert_eq!(pick_lopri_children(&children, 1.0), vec![t, t, t, t]);
        assert_eq!(pick_lopri_children(&children, 0.0), vec![f, f, f, f]);
    }
}
