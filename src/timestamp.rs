/// Width of the hardware trigger time tag.
pub const COUNTER_BITS: u32 = 31;
pub const COUNTER_MASK: u32 = (1 << COUNTER_BITS) - 1;
const COUNTER_RANGE: u64 = 1 << COUNTER_BITS;

/// Extends the 31-bit trigger time tag into a monotonic 64-bit count.
///
/// Counters must be fed in the order the device reported them; a value lower
/// than its predecessor is taken as one wraparound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampNormalizer {
    prev_raw: u32,
    rollovers: u64,
}

impl TimestampNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, raw: u32) -> u64 {
        let raw = raw & COUNTER_MASK;
        if raw < self.prev_raw {
            self.rollovers += 1;
        }
        self.prev_raw = raw;
        raw as u64 + self.rollovers * COUNTER_RANGE
    }

    pub fn rollovers(&self) -> u64 {
        self.rollovers
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
