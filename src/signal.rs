use std::sync::atomic::{AtomicU32, Ordering};

/// Number of dispatch vectors a worker can carry. Vector ids are `0..32`.
pub const VECTOR_CAPACITY: usize = 32;

/// Per-worker pending bitmask.
///
/// Bit `i` set means vector `i` has work. Producers set bits from any thread
/// with an atomic-or; only the owning worker clears, and it always clears the
/// whole word at once so a dispatch pass sees a consistent snapshot. The mask
/// is never guarded by a blocking lock.
pub struct Pending {
    value: AtomicU32,
}

impl Pending {
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Sets bit `index`, returning whether the word was empty before and
    /// whether this call was the one that set the bit.
    #[inline(always)]
    pub fn set(&self, index: u8) -> SetResult {
        debug_assert!((index as usize) < VECTOR_CAPACITY);
        let bit = 1u32 << (index as u32 & 31);
        let previous = self.value.fetch_or(bit, Ordering::AcqRel);
        SetResult {
            was_empty: previous == 0,
            was_set: (previous & bit) == 0,
        }
    }

    /// Snapshot-and-clear for the owning worker. Producer activity after the
    /// swap lands in the next snapshot.
    #[inline(always)]
    pub fn snapshot_clear(&self) -> u32 {
        self.value.swap(0, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn peek(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.peek() == 0
    }

    #[inline(always)]
    pub fn is_set(&self, index: u8) -> bool {
        let bit = 1u32 << (index as u32 & 31);
        (self.value.load(Ordering::Relaxed) & bit) != 0
    }
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetResult {
    pub was_empty: bool,
    pub was_set: bool,
}
