// SPDX-License-Identifier: Apache-2.0

//! Consistent-hash downgrade selection.
//!
//! Children sit on a ring of `2^64` positions at their (uniformly assigned)
//! ids. The selector reserves an arc whose length is proportional to the
//! target LOPRI fraction; children inside the arc are LOPRI. Growing the
//! fraction extends the arc's end forward, shrinking it advances the arc's
//! start forward, so both downgrades and upgrades happen in FIFO order: the
//! child downgraded first is also upgraded first.

use super::ChildFlowInfo;

/// Size of the ring (`2^64`), as a u128 so a full arc is representable.
const RING_SIZE: u128 = 1 << 64;

/// An inclusive id range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IdRange {
    /// Lowest id in the range.
    pub lo: u64,
    /// Highest id in the range (inclusive). The range is empty when
    /// `hi < lo`.
    pub hi: u64,
}

impl IdRange {
    /// Creates a range covering `lo..=hi`.
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }
}

/// A compact set of ids: ranges plus individual points.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnorderedIds {
    /// Inclusive ranges.
    pub ranges: Vec<IdRange>,
    /// Individual ids.
    pub points: Vec<u64>,
}

impl UnorderedIds {
    /// True when no range or point is present.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.points.is_empty()
    }
}

/// The change in LOPRI membership between two selector calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DowngradeDiff {
    /// Ids to flip HIPRI → LOPRI.
    pub to_downgrade: UnorderedIds,
    /// Ids to flip LOPRI → HIPRI.
    pub to_upgrade: UnorderedIds,
}

/// Sticky hashing selector; see the module docs for the arc model.
#[derive(Clone, Debug, Default)]
pub struct HashingDowngradeSelector {
    arc_start: u64,
    arc_len: u128,
}

fn frac_to_arc_len(frac: f64) -> u128 {
    if !(frac > 0.0) {
        return 0;
    }
    if frac >= 1.0 {
        return RING_SIZE;
    }
    (frac * RING_SIZE as f64) as u128
}

fn segment_ranges(seg_start: u64, seg_len: u128) -> Vec<IdRange> {
    if seg_len == 0 {
        return Vec::new();
    }
    if seg_len >= RING_SIZE {
        return vec![IdRange::new(0, u64::MAX)];
    }
    let end_incl = seg_start.wrapping_add((seg_len - 1) as u64);
    if end_incl >= seg_start {
        vec![IdRange::new(seg_start, end_incl)]
    } else {
        vec![IdRange::new(seg_start, u64::MAX), IdRange::new(0, end_incl)]
    }
}

impl HashingDowngradeSelector {
    /// Whether `child_id` currently falls inside the LOPRI arc.
    pub fn is_lopri(&self, child_id: u64) -> bool {
        (child_id.wrapping_sub(self.arc_start) as u128) < self.arc_len
    }

    /// Moves the arc to cover `want_frac_lopri` of the ring and returns the
    /// membership changes relative to the previous call.
    pub fn pick_children(&mut self, want_frac_lopri: f64) -> DowngradeDiff {
        let new_len = frac_to_arc_len(want_frac_lopri);
        let mut diff = DowngradeDiff::default();
        if new_len >= self.arc_len {
            let grow = new_len - self.arc_len;
            let seg_start = self.arc_start.wrapping_add(self.arc_len as u64);
            diff.to_downgrade.ranges = segment_ranges(seg_start, grow);
            self.arc_len = new_len;
        } else {
            let shrink = self.arc_len - new_len;
            diff.to_upgrade.ranges = segment_ranges(self.arc_start, shrink);
            self.arc_start = self.arc_start.wrapping_add(shrink as u64);
            self.arc_len = new_len;
        }
        diff
    }

    /// Moves the arc and returns the full LOPRI bitmap for `children`.
    pub fn pick_lopri_children(
        &mut self,
        children: &[ChildFlowInfo],
        want_frac_lopri: f64,
    ) -> Vec<bool> {
        let _ = self.pick_children(want_frac_lopri);
        children.iter().map(|c| self.is_lopri(c.child_id)).collect()
    }
}
