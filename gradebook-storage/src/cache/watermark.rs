//! Invalidation watermark.
//!
//! The backend bumps its watermark on every invalidation. A reader samples
//! the watermark before computing a report and hands it back with the put;
//! a put whose sample is older than the current watermark is dropped, so a
//! concurrent invalidation always wins over a stale fill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point in the invalidation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    /// Monotonically increasing; each invalidation increments it.
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            observed_at: Utc::now(),
        }
    }

    pub fn with_timestamp(sequence: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            observed_at,
        }
    }

    /// Beginning of time.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// The watermark after one more invalidation.
    pub fn advance(&self) -> Self {
        Self::new(self.sequence.saturating_add(1))
    }

    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.sequence > other.sequence
    }

    pub fn is_at_least(&self, other: &Watermark) -> bool {
        self.sequence >= other.sequence
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::zero()
    }
}
