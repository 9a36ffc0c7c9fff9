//! Sequence numbers for outbound agent reports.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic report counter.
///
/// Returns 0 on the first call and then every following integer exactly once.
/// A fresh counter belongs to each session.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Number of sequence numbers handed out so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}
