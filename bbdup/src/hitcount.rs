//! Per-thread countdown table that throttles promotion.
//!
//! Entries are addressed by `tag & (SIZE - 1)`; there is no chaining, so unrelated blocks may
//! share a counter. That can only make a promotion attempt come early or late: whether a case is
//! actually added is decided per block and per encoding under the table lock.

use static_assertions::const_assert;

/// The number of counters in a table.
pub const HIT_TABLE_SIZE: usize = 65536;
const_assert!(HIT_TABLE_SIZE.is_power_of_two());
const_assert!(HIT_TABLE_SIZE <= u32::MAX as usize);

#[derive(Debug)]
pub struct HitTable {
    threshold: u16,
    counts: Box<[u16]>,
}

impl HitTable {
    pub fn new(threshold: u16) -> Self {
        Self {
            threshold,
            counts: vec![threshold; HIT_TABLE_SIZE].into_boxed_slice(),
        }
    }

    /// The entry `tag` maps to.
    pub fn hash(tag: u64) -> u32 {
        // The const_assert above guarantees the mask fits in a u32.
        (tag & (HIT_TABLE_SIZE as u64 - 1)) as u32
    }

    /// The address of the counters, as stored in [crate::ir::Slot::HitTable].
    pub fn addr(&self) -> u64 {
        self.counts.as_ptr() as u64
    }

    pub fn threshold(&self) -> u16 {
        self.threshold
    }

    pub fn count(&self, tag: u64) -> u16 {
        self.counts[Self::hash(tag) as usize]
    }

    /// Decrement entry `idx`, returning true if it reached zero. This is the out-of-line
    /// equivalent of [crate::ir::InstKind::DecHitCount]: the counter wraps rather than saturates.
    pub fn decrement_at(&mut self, idx: u32) -> bool {
        let c = &mut self.counts[idx as usize];
        *c = c.wrapping_sub(1);
        *c == 0
    }

    /// Decrement the entry for `tag`, returning true if the threshold has been reached.
    pub fn decrement_and_test(&mut self, tag: u64) -> bool {
        self.decrement_at(Self::hash(tag))
    }

    /// Put the entry for `tag` back to the threshold.
    pub fn reset(&mut self, tag: u64) {
        self.counts[Self::hash(tag) as usize] = self.threshold;
    }
}
