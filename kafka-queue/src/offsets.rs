//! Offset Tracker - last acknowledged offset per topic, used to compute lag
//! against the broker's newest offset.

use std::sync::atomic::{AtomicI64, Ordering};

/// Nothing acknowledged yet
pub const NO_OFFSET: i64 = -1;

/// Lock-free high-water mark of acknowledged offsets.
///
/// Acknowledgements from different reader workers race freely; the cell only
/// ever moves forward so a late ack of an older record cannot hide a newer one.
#[derive(Debug)]
pub struct OffsetTracker {
    last_acked: AtomicI64,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self {
            last_acked: AtomicI64::new(NO_OFFSET),
        }
    }

    pub fn mark_acked(&self, offset: i64) {
        self.last_acked.fetch_max(offset, Ordering::AcqRel);
    }

    pub fn last_acked(&self) -> i64 {
        self.last_acked.load(Ordering::Acquire)
    }

    /// Records between the last acknowledged one and `newest_offset`, the
    /// broker's next offset to be written.
    pub fn lag(&self, newest_offset: i64) -> i64 {
        newest_offset - self.last_acked() - 1
    }
}
