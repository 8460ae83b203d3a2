// crates/challengectl-core/src/core/time.rs
// ============================================================================
// Module: ChallengeCtl Timestamps
// Description: Unix-millisecond timestamp newtype used across all entities.
// Purpose: Give every stored timestamp a single, deterministic representation.
// Dependencies: serde, std::time
// ============================================================================

//! ## Overview
//! All persisted and wire timestamps are Unix milliseconds. `Timestamp::now`
//! is the only place wall-clock time enters the system; every other
//! constructor is deterministic, which keeps dispatch-core logic testable
//! without a clock dependency injection layer.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// A point in time expressed as Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }

    /// Builds a timestamp from a raw Unix-millisecond value.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the raw Unix-millisecond value.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns a timestamp offset forward by the given number of milliseconds.
    #[must_use]
    pub fn plus_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Returns whether `self` is strictly before `other`.
    #[must_use]
    pub const fn is_before(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
