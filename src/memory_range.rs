use std::cmp::{max, min};
use std::fmt::{Display, Formatter, Result};

/// A contiguous range of target-process virtual addresses.
///
/// Note: The end point (`end_`) is implicitly NOT included in the range.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct MemoryRange {
    start_: usize,
    end_: usize,
}

impl MemoryRange {
    pub fn new_range(addr: usize, num_bytes: usize) -> MemoryRange {
        // If there is an overflow in addition, rust should panic in debug mode.
        // So no need for debug_assert!(result.start_ <= result.end_).
        MemoryRange {
            start_: addr,
            end_: addr + num_bytes,
        }
    }

    pub fn from_range(addr: usize, end: usize) -> MemoryRange {
        let result = MemoryRange {
            start_: addr,
            end_: end,
        };
        debug_assert!(result.start_ <= result.end_);
        result
    }

    /// Return true iff `other` is an address range fully contained by self.
    pub fn contains(&self, other: &Self) -> bool {
        self.start_ <= other.start_ && other.end_ <= self.end_
    }

    /// Note that we have p < self.end_ and not p <= self.end_ here.
    pub fn contains_addr(&self, p: usize) -> bool {
        self.start_ <= p && p < self.end_
    }

    pub fn intersect(&self, other: &MemoryRange) -> MemoryRange {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        MemoryRange {
            start_: s,
            end_: max(s, e),
        }
    }

    pub fn intersects(&self, other: &MemoryRange) -> bool {
        let s = max(self.start_, other.start_);
        let e = min(self.end_, other.end_);
        s < e
    }

    pub fn start(&self) -> usize {
        self.start_
    }

    pub fn end(&self) -> usize {
        self.end_
    }

    pub fn size(&self) -> usize {
        self.end_ - self.start_
    }

    pub fn is_empty(&self) -> bool {
        self.start_ == self.end_
    }
}

impl Display for MemoryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}-{:#x}", self.start_, self.end_)
    }
}
