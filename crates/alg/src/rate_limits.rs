// SPDX-License-Identifier: Apache-2.0

//! Corrections applied to admissions when converting them into per-child
//! rate limits.

/// The burstiness of an aggregate: `Σ child demand / parent demand`.
///
/// Hosts whose bursts are uncorrelated sum to more demand than the aggregate
/// shows. Scaling an admission by this factor lets hosts burst individually
/// while still obeying the admission in aggregate, assuming burstiness stays
/// stable over time.
///
/// Clamped to 1 when either operand is zero or when the child sum does not
/// exceed the parent demand (the two are measured differently, so the parent
/// can legitimately come out larger).
pub fn bwe_burstiness_factor(parent_demand_bps: f64, sum_child_demand_bps: f64) -> f64 {
    if parent_demand_bps == 0.0 || sum_child_demand_bps == 0.0 {
        return 1.0;
    }
    if sum_child_demand_bps < parent_demand_bps {
        return 1.0;
    }
    sum_child_demand_bps / parent_demand_bps
}

/// How much extra bandwidth each child receives if the admission left over
/// after the waterlevel fill is spread evenly.
pub fn evenly_distribute_extra(admission: i64, demands: &[i64], waterlevel: i64) -> i64 {
    if demands.is_empty() {
        return admission;
    }
    let mut extra = admission;
    for &d in demands {
        extra -= d.min(waterlevel);
    }
    extra = extra.max(0);
    extra / demands.len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burstiness_clamps_to_one() {
        assert_eq!(bwe_burstiness_factor(0.0, 100.0), 1.0);
        assert_eq!(bwe_burstiness_factor(100.0, 0.0), 1.0);
        assert_eq!(bwe_burstiness_factor(100.0, 80.0), 1.0);
    }

    #[test]
    fn burstiness_ratio() {
        assert_eq!(bwe_burstiness_factor(100.0, 150.0), 1.5);
    }

    #[test]
    fn bonus_distributes_leftover() {
        // Waterlevel 10 fills 5 + 10 + 10 = 25 of 40; 15 left over for 3.
        assert_eq!(evenly_distribute_extra(40, &[5, 12, 37], 10), 5);
        assert_eq!(evenly_distribute_extra(25, &[5, 12, 37], 10), 0);
        // Oversubscribed fill never yields a negative bonus.
        assert_eq!(evenly_distribute_extra(10, &[5, 12, 37], 10), 0);
        assert_eq!(evenly_distribute_extra(77, &[], 10), 77);
    }
}
