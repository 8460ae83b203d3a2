// crates/challengectl-core/src/core/model.rs
// ============================================================================
// Module: ChallengeCtl Data Model
// Description: Entity types shared by the dispatch core, store, and API.
// Purpose: Give every crate in the workspace one canonical definition of a
//          Challenge, Runner, Transmission, File, and Enrollment Token.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! These are pure data types: no I/O, no locking, no clock reads beyond what
//! callers pass in. `ChallengeStatus` carries the state machine from the
//! Dispatch Core design as an enum plus a `can_transition_to` helper used by
//! tests and assertions; production transitions are written out explicitly
//! at each call site rather than routed through a generic transition
//! function.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::ChallengeId;
use crate::core::identifiers::DeviceId;
use crate::core::identifiers::EnrollmentToken;
use crate::core::identifiers::FileDigest;
use crate::core::identifiers::RunnerId;
use crate::core::identifiers::TransmissionId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Challenge
// ============================================================================

/// Lifecycle status of a challenge.
///
/// # Invariants
/// - `Assigned` carries `assigned_to`, `assigned_at`, `assignment_expires`,
///   and `assigned_frequency_hz` on the owning [`Challenge`]; every other
///   variant requires those fields to be `None`.
/// - There is no terminal state; challenges cycle until disabled or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    /// Not eligible for assignment; only an explicit `enable` leaves this state.
    Disabled,
    /// Eligible for assignment on the next `assign_one`.
    Queued,
    /// Exclusively held by one runner until completion or expiry.
    Assigned,
    /// Completed at least once; waiting for `next_tx_time` to elapse.
    Waiting,
}

impl ChallengeStatus {
    /// Returns whether a direct transition from `self` to `next` is legal
    /// under the state machine in the Dispatch Core design.
    ///
    /// Used only by tests and debug assertions; production code constructs
    /// the next state directly inside its owning transaction.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ChallengeStatus::{Assigned, Disabled, Queued, Waiting};
        match (self, next) {
            (_, Disabled) => true,
            (Disabled, Queued) => true,
            (Queued, Assigned) => true,
            (Assigned, Waiting) => true,
            (Waiting, Queued) => true,
            _ => false,
        }
    }
}

/// A closed integer frequency interval in Hz, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyRange {
    /// Lower bound, inclusive.
    pub low_hz: u64,
    /// Upper bound, inclusive.
    pub high_hz: u64,
}

impl FrequencyRange {
    /// Builds a range, swapping bounds if given in reverse order.
    #[must_use]
    pub const fn new(a: u64, b: u64) -> Self {
        if a <= b {
            Self { low_hz: a, high_hz: b }
        } else {
            Self { low_hz: b, high_hz: a }
        }
    }

    /// Returns whether `hz` falls within `[low_hz, high_hz]`.
    #[must_use]
    pub const fn contains(self, hz: u64) -> bool {
        hz >= self.low_hz && hz <= self.high_hz
    }

    /// Returns the intersection of two ranges, or `None` if disjoint.
    #[must_use]
    pub const fn intersect(self, other: Self) -> Option<Self> {
        let low = if self.low_hz > other.low_hz { self.low_hz } else { other.low_hz };
        let high = if self.high_hz < other.high_hz { self.high_hz } else { other.high_hz };
        if low <= high {
            Some(Self { low_hz: low, high_hz: high })
        } else {
            None
        }
    }
}

/// The allowed frequency set for a challenge, as parsed from its config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrequencySpec {
    /// A single exact transmission frequency.
    SingleHz {
        /// The frequency, in Hz.
        hz: u64,
    },
    /// A set of named, possibly disjoint ranges.
    NamedRanges {
        /// The ranges, in no particular order.
        ranges: Vec<FrequencyRange>,
    },
    /// A single contiguous range.
    ExplicitRange {
        /// The range.
        range: FrequencyRange,
    },
}

impl FrequencySpec {
    /// Returns the allowed ranges as a flat list, collapsing `SingleHz` into
    /// a degenerate one-point range.
    #[must_use]
    pub fn ranges(&self) -> Vec<FrequencyRange> {
        match self {
            Self::SingleHz { hz } => vec![FrequencyRange::new(*hz, *hz)],
            Self::NamedRanges { ranges } => ranges.clone(),
            Self::ExplicitRange { range } => vec![*range],
        }
    }
}

/// A file reference inside a challenge config: either content-addressed
/// (`sha256:<digest>`) or resolved locally by the runner agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileReference {
    /// Content-addressed reference, fetched from the File Blob Store.
    ContentAddressed {
        /// Digest of the referenced file.
        digest: FileDigest,
    },
    /// Local reference, resolved relative to the runner's working directory.
    Local {
        /// Path relative to the runner's working directory.
        path: String,
    },
}

/// Deserialized, validated challenge configuration.
///
/// Stored durably as canonical JSON bytes (see
/// [`crate::core::hashing::canonical_json_bytes`]); this struct is the
/// result of parsing those bytes once at load and on every admin write, not
/// re-parsed per poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Waveform family identifier; opaque to the dispatch core.
    pub modulation: String,
    /// Allowed transmission frequencies.
    pub frequency_spec: FrequencySpec,
    /// Files the runner must have cached before transmitting.
    pub files: Vec<FileReference>,
    /// Minimum post-completion delay, in milliseconds.
    pub delay_min_ms: u64,
    /// Maximum post-completion delay, in milliseconds.
    pub delay_max_ms: u64,
    /// Dispatch priority; higher values are preferred.
    pub priority: i64,
    /// Whether the challenge participates in assignment at all.
    pub enabled: bool,
    /// Whether anonymous dashboard viewers may see this challenge's counts.
    pub public_view: bool,
}

/// A registered RF transmission job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Stable unique identity.
    pub id: ChallengeId,
    /// Human-readable unique name.
    pub name: String,
    /// Deserialized configuration.
    pub config: ChallengeConfig,
    /// Whether this challenge currently participates in assignment.
    pub enabled: bool,
    /// Dispatch priority, higher first; mirrors `config.priority`.
    pub priority: i64,
    /// Current lifecycle state.
    pub status: ChallengeStatus,
    /// Runner currently holding the assignment, if any.
    pub assigned_to: Option<RunnerId>,
    /// When the current assignment was made, if any.
    pub assigned_at: Option<Timestamp>,
    /// When the current assignment expires and becomes requeueable.
    pub assignment_expires: Option<Timestamp>,
    /// The exact frequency chosen for the current assignment, in Hz.
    pub assigned_frequency_hz: Option<u64>,
    /// Timestamp of the most recently completed transmission.
    pub last_tx_time: Option<Timestamp>,
    /// Timestamp at which this challenge next becomes eligible.
    pub next_tx_time: Option<Timestamp>,
    /// Monotonically non-decreasing count of completed transmissions.
    pub transmission_count: u64,
}

impl Challenge {
    /// Returns whether the assignment fields are in the shape the state
    /// machine invariant requires for `status`.
    #[must_use]
    pub const fn assignment_fields_consistent(&self) -> bool {
        let all_set = self.assigned_to.is_some() && self.assigned_at.is_some() && self.assignment_expires.is_some();
        let all_clear = self.assigned_to.is_none() && self.assigned_at.is_none() && self.assignment_expires.is_none();
        match self.status {
            ChallengeStatus::Assigned => all_set,
            ChallengeStatus::Disabled | ChallengeStatus::Queued | ChallengeStatus::Waiting => all_clear,
        }
    }
}

// ============================================================================
// SECTION: Runner
// ============================================================================

/// Liveness state of a registered runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Heartbeating within `HeartbeatTimeout` and not holding an assignment.
    Online,
    /// Heartbeating and currently holding an assignment.
    Busy,
    /// Last heartbeat older than `HeartbeatTimeout`.
    Offline,
}

/// A device attached to a runner, with its transmit frequency capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identity of the device.
    pub id: DeviceId,
    /// Human-readable device name.
    pub name: String,
    /// Hardware model string.
    pub model: String,
    /// Closed frequency intervals this device can transmit on.
    pub frequency_limits: Vec<FrequencyRange>,
}

impl Device {
    /// Returns whether any of this device's frequency ranges contain `hz`.
    #[must_use]
    pub fn covers(&self, hz: u64) -> bool {
        self.frequency_limits.iter().any(|range| range.contains(hz))
    }
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    /// Stable unique identity, assigned at enrollment.
    pub id: RunnerId,
    /// Reported hostname.
    pub hostname: String,
    /// Reported IP address.
    pub ip: String,
    /// Reported MAC address, used as a host identifier in principal resolution.
    pub mac: String,
    /// Reported machine identifier, used as a host identifier in principal resolution.
    pub machine_id: String,
    /// Current liveness state.
    pub status: RunnerStatus,
    /// Whether this runner may receive assignments.
    pub enabled: bool,
    /// Timestamp of the most recent heartbeat or registration.
    pub last_heartbeat: Timestamp,
    /// Devices this runner has reported.
    pub devices: Vec<Device>,
    /// One-way hash of the runner's API key.
    pub api_key_hash: String,
}

impl Runner {
    /// Returns the union of every device's frequency ranges.
    #[must_use]
    pub fn capability_union(&self) -> Vec<FrequencyRange> {
        self.devices.iter().flat_map(|device| device.frequency_limits.iter().copied()).collect()
    }

    /// Returns the first device whose capabilities contain `hz`, if any.
    #[must_use]
    pub fn device_for_frequency(&self, hz: u64) -> Option<&Device> {
        self.devices.iter().find(|device| device.covers(hz))
    }
}

// ============================================================================
// SECTION: Transmission
// ============================================================================

/// Outcome of a completed transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    /// The transmit callable exited zero and no exception propagated.
    Success,
    /// The transmit callable failed, timed out, or was never reachable.
    Failure,
}

/// An immutable, append-only record of one completed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transmission {
    /// Store-assigned, monotonically increasing row identifier.
    pub id: TransmissionId,
    /// The challenge this attempt was for.
    pub challenge_id: ChallengeId,
    /// The runner that performed (or was assigned) the attempt.
    pub runner_id: RunnerId,
    /// The device used, if one was selected before failure.
    pub device_id: Option<DeviceId>,
    /// The actual transmission frequency, if one was selected.
    pub frequency_hz: Option<u64>,
    /// When the assignment that produced this attempt began.
    pub started_at: Timestamp,
    /// When this attempt was reported complete.
    pub completed_at: Timestamp,
    /// Outcome of the attempt.
    pub status: TransmissionStatus,
    /// Present only when `status = Failure`.
    pub error_message: Option<String>,
}

// ============================================================================
// SECTION: File
// ============================================================================

/// Metadata for a content-addressed file registered with the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// SHA-256 digest of the content; also the storage key.
    pub digest: FileDigest,
    /// Original filename, for display and content negotiation only.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Reported MIME type.
    pub mime_type: String,
}

// ============================================================================
// SECTION: Enrollment Token
// ============================================================================

/// A one-time credential exchanged for a durable runner API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentTokenRecord {
    /// The opaque bearer token presented by the enrolling agent.
    pub token: EnrollmentToken,
    /// Human-assigned name for the runner being enrolled.
    pub runner_name: String,
    /// Identity of the admin principal that minted this token.
    pub created_by: String,
    /// When the token was minted.
    pub created_at: Timestamp,
    /// When the token stops being redeemable.
    pub expires_at: Timestamp,
    /// Whether the token has already been consumed.
    pub used: bool,
    /// The runner created by consuming this token, if consumed.
    pub used_by_runner_id: Option<RunnerId>,
    /// If this token re-enrolls an existing runner rather than creating one.
    pub re_enrollment_for: Option<RunnerId>,
}

// ============================================================================
// SECTION: Principal
// ============================================================================

/// The authenticated identity of a request after principal resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A runner authenticated by API key plus matching host identifiers.
    Runner(RunnerId),
    /// An administrator authenticated by a TOTP-verified session.
    Admin(String),
    /// A holder of a provisioning key, authorized to mint enrollment tokens.
    Provisioning,
    /// A holder of an unused, unexpired enrollment token.
    Enrollment(EnrollmentToken),
    /// No credentials matched any rule.
    Anonymous,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;

    #[test]
    fn frequency_range_intersect_overlapping() {
        let a = FrequencyRange::new(144_000_000, 148_000_000);
        let b = FrequencyRange::new(146_000_000, 150_000_000);
        let intersection = a.intersect(b).expect("ranges overlap");
        assert_eq!(intersection.low_hz, 146_000_000);
        assert_eq!(intersection.high_hz, 148_000_000);
    }

    #[test]
    fn frequency_range_intersect_disjoint_is_none() {
        let a = FrequencyRange::new(144_000_000, 148_000_000);
        let b = FrequencyRange::new(420_000_000, 450_000_000);
        assert!(a.intersect(b).is_none());
    }

    #[test]
    fn challenge_status_transitions_match_state_machine() {
        assert!(ChallengeStatus::Disabled.can_transition_to(ChallengeStatus::Queued));
        assert!(ChallengeStatus::Queued.can_transition_to(ChallengeStatus::Assigned));
        assert!(ChallengeStatus::Assigned.can_transition_to(ChallengeStatus::Waiting));
        assert!(ChallengeStatus::Waiting.can_transition_to(ChallengeStatus::Queued));
        assert!(!ChallengeStatus::Queued.can_transition_to(ChallengeStatus::Waiting));
        assert!(ChallengeStatus::Assigned.can_transition_to(ChallengeStatus::Disabled));
    }

    #[test]
    fn device_covers_checks_all_ranges() {
        let device = Device {
            id: DeviceId::new("dev-1"),
            name: "hackrf-0".to_owned(),
            model: "HackRF One".to_owned(),
            frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000), FrequencyRange::new(420_000_000, 450_000_000)],
        };
        assert!(device.covers(146_550_000));
        assert!(device.covers(433_000_000));
        assert!(!device.covers(915_000_000));
    }
}
