//! Sequence numbering and gap detection.
//!
//! # What is a sequence number? (for beginners)
//!
//! Every sample a device emits carries a monotonically increasing integer
//! called a *sequence number*.  The controller never reorders samples by it;
//! samples are stored in arrival order.  Instead it is used to:
//!
//! - **Detect loss**: receiving 1, 2 and 5 means 3 and 4 never arrived.
//! - **Detect reordering or duplicates**: receiving 7 after 9.
//!
//! [`SequenceTracker`] turns a stream of sequence numbers into those
//! observations.  [`SequenceCounter`] is the controller-side generator used to
//! number time-sync probes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A thread-safe, monotonically increasing counter.
///
/// # Examples
///
/// ```rust
/// use gsr_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Returns the next value; wraps from `u64::MAX` to 0.
    ///
    /// `Relaxed` is enough: the value orders probes, it does not publish
    /// memory to other threads.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the value the next call to [`next`](Self::next) will yield.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// What a single sequence number says about the stream so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceObservation {
    /// First number ever seen on this stream.
    First,
    /// Exactly one more than the previous number.
    InOrder,
    /// Numbers were skipped; `missing` is how many.
    Gap {
        expected: u64,
        received: u64,
        missing: u64,
    },
    /// Not greater than the highest number seen (duplicate or late arrival).
    OutOfOrder { highest: u64, received: u64 },
}

/// Tracks the highest sequence number seen on one device stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    highest: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies `seq` against the stream seen so far and advances the
    /// high-water mark when `seq` moves forward.
    pub fn observe(&mut self, seq: u64) -> SequenceObservation {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return SequenceObservation::First;
        };

        if seq <= highest {
            return SequenceObservation::OutOfOrder {
                highest,
                received: seq,
            };
        }

        self.highest = Some(seq);
        let expected = highest + 1;
        if seq == expected {
            SequenceObservation::InOrder
        } else {
            SequenceObservation::Gap {
                expected,
                received: seq,
                missing: seq - expected,
            }
        }
    }

    /// Highest sequence number observed, if any.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counter_starts_at_zero_and_increments() {
        let c = SequenceCounter::new();
        assert_eq!(c.next(), 0);
        assert_eq!(c.next(), 1);
        assert_eq!(c.current(), 2);
    }

    #[test]
    fn test_counter_is_unique_across_threads() {
        // Arrange
        let c = Arc::new(SequenceCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || (0..250).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Assert
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_tracker_reports_first_then_in_order() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(10), SequenceObservation::First);
        assert_eq!(t.observe(11), SequenceObservation::InOrder);
        assert_eq!(t.highest(), Some(11));
    }

    #[test]
    fn test_tracker_reports_gap_width() {
        let mut t = SequenceTracker::new();
        t.observe(1);
        assert_eq!(
            t.observe(5),
            SequenceObservation::Gap {
                expected: 2,
                received: 5,
                missing: 3
            }
        );
        assert_eq!(t.observe(6), SequenceObservation::InOrder);
    }

    #[test]
    fn test_tracker_flags_duplicates_without_moving_backwards() {
        let mut t = SequenceTracker::new();
        t.observe(3);
        t.observe(4);
        assert_eq!(
            t.observe(4),
            SequenceObservation::OutOfOrder {
                highest: 4,
                received: 4
            }
        );
        assert_eq!(
            t.observe(2),
            SequenceObservation::OutOfOrder {
                highest: 4,
                received: 2
            }
        );
        assert_eq!(t.highest(), Some(4));
        assert_eq!(t.observe(5), SequenceObservation::InOrder);
    }
}
