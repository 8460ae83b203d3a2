// crates/challengectl-core/src/interfaces/mod.rs
// ============================================================================
// Module: ChallengeCtl Interfaces
// Description: Trait seams between the dispatch/API layers and their
//              pluggable backends (durable store, blob store, event sink,
//              auth audit sink).
// Purpose: Let `challengectl-dispatch` and `challengectl-api` depend only on
//          these traits, never on `rusqlite` or filesystem types directly.
// Dependencies: async-trait, bytes, serde, thiserror, tokio-stream
// ============================================================================

//! ## Overview
//! Every operation that reads-modifies-writes state is a single method on
//! [`DurableStore`]; implementations are responsible for wrapping their body
//! in a single immediate-write transaction. This keeps call sites ignorant
//! of connection or transaction types, with the trait seam drawn between
//! this core crate and its SQLite-backed store crate.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio_stream::Stream;

use crate::core::identifiers::ChallengeId;
use crate::core::identifiers::DeviceId;
use crate::core::identifiers::EnrollmentToken;
use crate::core::identifiers::FileDigest;
use crate::core::identifiers::RunnerId;
use crate::core::model::Challenge;
use crate::core::model::ChallengeConfig;
use crate::core::model::Device;
use crate::core::model::EnrollmentTokenRecord;
use crate::core::model::FileRecord;
use crate::core::model::Runner;
use crate::core::model::RunnerStatus;
use crate::core::model::Transmission;
use crate::core::model::TransmissionStatus;

// ============================================================================
// SECTION: Durable Store Errors
// ============================================================================

/// Failure modes surfaced by a [`DurableStore`] implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// A conditional write lost a race (e.g. an already-used enrollment token).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Stored schema version is newer than this binary understands.
    #[error("schema version mismatch")]
    VersionMismatch,
    /// The write-lock could not be acquired within the configured deadline.
    #[error("write lock contention exceeded deadline")]
    Capacity,
    /// A transient I/O failure; callers may retry with backoff.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    /// Stored content failed an integrity check; not safe to continue.
    #[error("fatal storage corruption: {0}")]
    FatalCorruption(String),
}

// ============================================================================
// SECTION: Durable Store Request/Response Types
// ============================================================================

/// Input to [`DurableStore::register_runner`].
#[derive(Debug, Clone)]
pub struct RunnerRegistration {
    /// Reported hostname.
    pub hostname: String,
    /// Reported IP address.
    pub ip: String,
    /// Reported MAC address.
    pub mac: String,
    /// Reported machine identifier.
    pub machine_id: String,
    /// Devices and their frequency capabilities.
    pub devices: Vec<Device>,
    /// One-way hash of the runner's API key, recorded at enrollment.
    pub api_key_hash: String,
}

/// Input to [`DurableStore::report_complete`].
#[derive(Debug, Clone)]
pub struct ReportCompleteInput {
    /// Runner reporting completion.
    pub runner_id: RunnerId,
    /// Challenge the runner believes it was assigned.
    pub challenge_id: ChallengeId,
    /// Device actually used, if selection succeeded.
    pub device_id: Option<DeviceId>,
    /// Frequency actually used, if selection succeeded.
    pub frequency_hz: Option<u64>,
    /// Whether the transmit callable succeeded.
    pub outcome: TransmissionStatus,
    /// Present when `outcome = Failure`.
    pub error_message: Option<String>,
}

/// Result of [`DurableStore::report_complete`].
#[derive(Debug, Clone)]
pub enum ReportCompleteOutcome {
    /// The assignment matched; the challenge transitioned to `waiting`.
    Recorded(Transmission),
    /// The caller no longer held the assignment; the challenge did not
    /// transition. A transmission row is written regardless, for audit.
    StaleAssignment(Transmission),
}

/// Result of [`DurableStore::signout`].
#[derive(Debug, Clone)]
pub struct SignoutOutcome {
    /// The synthesized failed transmission and the challenge it belonged to,
    /// if an in-flight assignment was cleared as a side effect.
    pub cleared_assignment: Option<(Transmission, ChallengeId)>,
}

/// Result of [`DurableStore::disable`].
#[derive(Debug, Clone)]
pub struct DisableOutcome {
    /// The runner that held the assignment at the moment of disable, if any.
    /// The caller uses this to emit a best-effort "disown" event.
    pub disowned_runner: Option<RunnerId>,
}

/// One entry in a [`DurableStore::reload`] call: add-or-update by name.
#[derive(Debug, Clone)]
pub struct ChallengeConfigUpsert {
    /// Unique challenge name; the diff key.
    pub name: String,
    /// Configuration to store.
    pub config: ChallengeConfig,
}

/// Result of a successful [`DurableStore::enroll`].
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    /// Identity assigned to the newly created (or re-enrolled) runner.
    pub runner_id: RunnerId,
    /// Plaintext API key. Returned exactly once; only its hash is persisted.
    pub api_key_plaintext: String,
}

/// Input to [`DurableStore::mint_enrollment_token`].
#[derive(Debug, Clone)]
pub struct MintEnrollmentTokenInput {
    /// Human-assigned name for the runner being enrolled.
    pub runner_name: String,
    /// Identity of the admin principal minting this token.
    pub created_by: String,
    /// How long the token remains redeemable, in milliseconds.
    pub ttl_ms: i64,
    /// If this token re-enrolls an existing runner rather than creating one.
    pub re_enrollment_for: Option<RunnerId>,
}

/// Aggregated counts for the admin/public dashboard.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DashboardStats {
    /// Number of challenges in each status.
    pub challenges_disabled: u64,
    /// See [`DashboardStats::challenges_disabled`].
    pub challenges_queued: u64,
    /// See [`DashboardStats::challenges_disabled`].
    pub challenges_assigned: u64,
    /// See [`DashboardStats::challenges_disabled`].
    pub challenges_waiting: u64,
    /// Number of runners in each status.
    pub runners_online: u64,
    /// See [`DashboardStats::runners_online`].
    pub runners_busy: u64,
    /// See [`DashboardStats::runners_online`].
    pub runners_offline: u64,
    /// Total transmissions ever recorded.
    pub total_transmissions: u64,
    /// Names of challenges with `public_view = true`, for anonymous viewers.
    pub public_challenge_names: Vec<String>,
}

// ============================================================================
// SECTION: Durable Store
// ============================================================================

/// The persistent, single-writer state backend.
///
/// Every method that reads-modifies-writes state is specified to execute
/// inside a single immediate-write transaction: callers never see partial
/// effects of a concurrent call to any other mutating method.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Upserts a runner row by host identifiers, sets it online.
    async fn register_runner(&self, registration: RunnerRegistration) -> Result<Runner, StoreError>;

    /// Records a heartbeat and promotes `offline` runners back to `online`.
    async fn heartbeat(&self, runner_id: &RunnerId) -> Result<(), StoreError>;

    /// Marks a runner offline and clears (as failed) any held assignment.
    async fn signout(&self, runner_id: &RunnerId) -> Result<SignoutOutcome, StoreError>;

    /// Atomically selects and assigns the best eligible challenge, if any,
    /// whose frequency spec intersects `freq_caps`.
    async fn assign_one(&self, runner_id: &RunnerId, freq_caps: &[crate::core::model::FrequencyRange]) -> Result<Option<Challenge>, StoreError>;

    /// Records a completion report; see [`ReportCompleteOutcome`].
    async fn report_complete(&self, input: ReportCompleteInput) -> Result<ReportCompleteOutcome, StoreError>;

    /// Forces a challenge's `next_tx_time` to now, promoting `waiting → queued`.
    async fn trigger(&self, challenge_id: &ChallengeId) -> Result<(), StoreError>;

    /// Enables a challenge for assignment.
    async fn enable(&self, challenge_id: &ChallengeId) -> Result<(), StoreError>;

    /// Forces a challenge to `disabled`, clearing any assignment.
    async fn disable(&self, challenge_id: &ChallengeId) -> Result<DisableOutcome, StoreError>;

    /// Diffs `upserts` against the stored set by name; adds new rows, updates
    /// existing ones. Rows absent from `upserts` are left untouched.
    async fn reload(&self, upserts: Vec<ChallengeConfigUpsert>) -> Result<(), StoreError>;

    /// Atomically consumes an enrollment token and creates its runner.
    async fn enroll(&self, token: &EnrollmentToken, runner_name: &str, mac: &str, machine_id: &str, api_key_hash: &str) -> Result<EnrollOutcome, StoreError>;

    /// Mints a new one-time enrollment token (admin action; not itself a
    /// dispatch operation, but required to populate the enrollment tokens
    /// that `enroll` consumes).
    async fn mint_enrollment_token(&self, input: MintEnrollmentTokenInput) -> Result<EnrollmentTokenRecord, StoreError>;

    /// Creates a new TOTP-verified admin session for `user`, valid for
    /// `ttl_ms` milliseconds, and returns its opaque bearer token.
    async fn create_admin_session(&self, user: &str, ttl_ms: i64) -> Result<String, StoreError>;

    /// Returns the session's owning username if `token` is an unexpired
    /// admin session, or `None` otherwise.
    async fn validate_admin_session(&self, token: &str) -> Result<Option<String>, StoreError>;

    /// Fetches a single challenge by id.
    async fn get_challenge(&self, challenge_id: &ChallengeId) -> Result<Challenge, StoreError>;

    /// Lists every challenge.
    async fn list_challenges(&self) -> Result<Vec<Challenge>, StoreError>;

    /// Fetches a single runner by id.
    async fn get_runner(&self, runner_id: &RunnerId) -> Result<Runner, StoreError>;

    /// Lists every runner.
    async fn list_runners(&self) -> Result<Vec<Runner>, StoreError>;

    /// Attempts to find the runner whose stored `api_key_hash` matches the
    /// bearer token, verified with a constant-time-safe comparison by the
    /// caller. Returns every enabled runner as verification candidates; the
    /// principal resolver performs the actual bcrypt comparison so the store
    /// never sees plaintext key material in its query layer.
    async fn list_enabled_runners(&self) -> Result<Vec<Runner>, StoreError>;

    /// Aggregated read-only counts for the dashboard.
    async fn dashboard_stats(&self) -> Result<DashboardStats, StoreError>;

    /// Marks runners whose `last_heartbeat` is older than `heartbeat_timeout_ms`
    /// as offline. Returns the ids affected.
    async fn sweep_stale_runners(&self, heartbeat_timeout_ms: i64) -> Result<Vec<RunnerId>, StoreError>;

    /// Requeues (as `waiting`, immediately eligible) every challenge whose
    /// assignment has expired. Returns the synthesized timeout transmission
    /// for each, along with the runner that lost the assignment, for event
    /// emission.
    async fn sweep_stale_assignments(&self) -> Result<Vec<(Transmission, RunnerId)>, StoreError>;

    /// Deletes or marks expired enrollment tokens and admin sessions.
    /// Returns the number of rows affected.
    async fn sweep_expired_tokens(&self) -> Result<u64, StoreError>;
}

// ============================================================================
// SECTION: Blob Store
// ============================================================================

/// Failure modes surfaced by a [`BlobStore`] implementation.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// No blob is registered under the requested digest.
    #[error("not found")]
    NotFound,
    /// Stored content's digest did not match its key; unsafe to serve.
    #[error("fatal storage corruption: content digest mismatch for {0}")]
    DigestMismatch(FileDigest),
    /// Underlying filesystem failure.
    #[error("blob store I/O failure: {0}")]
    Io(String),
}

/// A stream of content bytes, yielded incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BlobStoreError>> + Send>>;

/// Content-addressed binary storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Computes the SHA-256 digest of `bytes`, writes it to storage keyed by
    /// that digest, and returns it. A no-op (beyond the hash computation) if
    /// the digest is already present.
    async fn put(&self, bytes: &[u8]) -> Result<FileDigest, BlobStoreError>;

    /// Streams back the content stored under `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobStoreError::NotFound`] if no blob is registered, or
    /// [`BlobStoreError::DigestMismatch`] if the stream's content does not
    /// hash to `digest` (detected incrementally as bytes are read).
    async fn get(&self, digest: &FileDigest) -> Result<ByteStream, BlobStoreError>;

    /// Records filename/size/MIME metadata for an already-`put` digest.
    async fn register(&self, filename: &str, digest: &FileDigest, size: u64, mime_type: &str) -> Result<(), BlobStoreError>;

    /// Returns metadata for `digest`, if registered.
    async fn stat(&self, digest: &FileDigest) -> Result<Option<FileRecord>, BlobStoreError>;
}

// ============================================================================
// SECTION: Event Broadcaster
// ============================================================================

/// A typed, fire-and-forget state-change notification.
#[derive(Debug, Clone)]
pub enum Event {
    /// A challenge was assigned to a runner.
    ChallengeAssigned {
        /// The challenge as it looked immediately after assignment.
        challenge: Challenge,
    },
    /// A transmission attempt was recorded.
    TransmissionComplete {
        /// The recorded transmission row.
        transmission: Transmission,
        /// `Some(reason)` when synthesized by the controller rather than
        /// reported by the runner itself (e.g. `"timeout"`, `"shutdown"`).
        synthetic_reason: Option<String>,
    },
    /// A runner's liveness status changed.
    RunnerStatus {
        /// The runner whose status changed.
        runner_id: RunnerId,
        /// The new status.
        status: RunnerStatus,
    },
    /// A runner's assignment was forcibly cleared by an admin `disable`.
    /// Best-effort notice; the runner also learns this via `stale-assignment`
    /// on its own `report_complete`.
    Disown {
        /// The challenge that was disabled.
        challenge_id: ChallengeId,
        /// The runner that lost the assignment.
        runner_id: RunnerId,
    },
}

/// Fan-out sink for [`Event`] values.
///
/// Implementations MUST NOT hold any write lock while publishing, and MUST
/// NOT block the caller for more than a bounded interval regardless of how
/// many or how slow subscribers are.
pub trait EventLog: Send + Sync {
    /// Publishes `event` to every current subscriber. Best-effort: a
    /// subscriber with no room in its buffer simply misses the event (and,
    /// in a resumable transport, is expected to resynchronize from a fresh
    /// snapshot rather than be disconnected).
    fn publish(&self, event: Event);
}

// ============================================================================
// SECTION: Auth Audit Sink
// ============================================================================

/// The coarse class of principal a request resolved to (or failed to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrincipalClass {
    /// Resolved to a runner.
    Runner,
    /// Resolved to an admin session.
    Admin,
    /// Resolved to a provisioning key.
    Provisioning,
    /// Resolved to an enrollment token.
    Enrollment,
    /// No rule matched.
    Anonymous,
    /// A bearer token was presented but every matching rule rejected it.
    Rejected,
}

/// One principal-resolution outcome, recorded for audit regardless of
/// whether it succeeded.
#[derive(Debug, Clone)]
pub struct AuthAuditEvent {
    /// The resolved (or attempted) principal class.
    pub principal_class: PrincipalClass,
    /// Whether the request was allowed to proceed as that principal.
    pub allowed: bool,
    /// Human-readable reason, never containing secret material.
    pub reason: String,
    /// The peer address, if known.
    pub peer_addr: Option<String>,
    /// A SHA-256 fingerprint of the presented token, never the token itself.
    pub token_fingerprint: Option<String>,
}

impl AuthAuditEvent {
    /// Builds an "allowed" audit event.
    #[must_use]
    pub fn allow(principal_class: PrincipalClass, reason: impl Into<String>, peer_addr: Option<String>, token_fingerprint: Option<String>) -> Self {
        Self { principal_class, allowed: true, reason: reason.into(), peer_addr, token_fingerprint }
    }

    /// Builds a "denied" audit event.
    #[must_use]
    pub fn deny(principal_class: PrincipalClass, reason: impl Into<String>, peer_addr: Option<String>, token_fingerprint: Option<String>) -> Self {
        Self { principal_class, allowed: false, reason: reason.into(), peer_addr, token_fingerprint }
    }
}

/// Sink for [`AuthAuditEvent`] records produced by principal resolution.
pub trait AuthAuditSink: Send + Sync {
    /// Records one resolution outcome.
    fn record(&self, event: AuthAuditEvent);
}

/// An audit sink that discards every event. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

impl AuthAuditSink for NoopAuditSink {
    fn record(&self, _event: AuthAuditEvent) {}
}

/// An audit sink that writes one JSON line per event to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrAuditSink;

impl AuthAuditSink for StderrAuditSink {
    fn record(&self, event: AuthAuditEvent) {
        if let Ok(payload) = serde_json::to_string(&SerializableAuthAuditEvent::from(&event)) {
            let _ = std::io::Write::write_fmt(&mut std::io::stderr(), format_args!("{payload}\n"));
        }
    }
}

/// Serializable mirror of [`AuthAuditEvent`]; the event itself stays
/// `Serialize`-free so call sites never accidentally log it through a
/// generic derive that forgets the token-fingerprint-only rule.
#[derive(Serialize)]
struct SerializableAuthAuditEvent<'a> {
    event: &'static str,
    principal_class: PrincipalClass,
    allowed: bool,
    reason: &'a str,
    peer_addr: Option<&'a str>,
    token_fingerprint: Option<&'a str>,
}

impl<'a> From<&'a AuthAuditEvent> for SerializableAuthAuditEvent<'a> {
    fn from(event: &'a AuthAuditEvent) -> Self {
        Self {
            event: "principal_resolved",
            principal_class: event.principal_class,
            allowed: event.allowed,
            reason: event.reason.as_str(),
            peer_addr: event.peer_addr.as_deref(),
            token_fingerprint: event.token_fingerprint.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_audit_sink_accepts_any_event() {
        let sink = NoopAuditSink;
        sink.record(AuthAuditEvent::deny(PrincipalClass::Rejected, "bad mac", None, None));
    }

    #[test]
    fn audit_event_constructors_set_allowed_flag() {
        let allowed = AuthAuditEvent::allow(PrincipalClass::Runner, "matched", None, None);
        assert!(allowed.allowed);
        let denied = AuthAuditEvent::deny(PrincipalClass::Runner, "host id mismatch", None, None);
        assert!(!denied.allowed);
    }
}
