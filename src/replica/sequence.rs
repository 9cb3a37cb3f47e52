use crate::core::SequenceNumber;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Level, event};

/// Remembers the highest sequence number read from one handle so that
/// callers never see it go backwards.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    highest: AtomicU64,
    observed: AtomicBool,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value read from the store and return the value to report.
    pub fn observe(&self, sequence: SequenceNumber) -> SequenceNumber {
        let previous = self.highest.fetch_max(sequence, Ordering::AcqRel);
        self.observed.store(true, Ordering::Release);
        if sequence < previous {
            event!(
                Level::WARN,
                sequence,
                previous,
                "store reported a sequence number lower than one already observed"
            );
            return previous;
        }
        sequence
    }

    /// Highest value observed so far, if any
    pub fn last_observed(&self) -> Option<SequenceNumber> {
        if self.observed.load(Ordering::Acquire) {
            Some(self.highest.load(Ordering::Acquire))
        } else {
            None
        }
    }
}
