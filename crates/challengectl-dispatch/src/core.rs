// crates/challengectl-dispatch/src/core.rs
// ============================================================================
// Module: Dispatch Core
// Description: Orchestrates `DurableStore` operations with post-commit event
//              publication.
// Purpose: The single call-site the control plane API and runner-facing
//          operations use for every state-changing operation.
// Dependencies: bcrypt, challengectl-core, rand, tokio
// ============================================================================

//! ## Overview
//! Every method here is a direct translation of one dispatch operation. None of them touch SQL or file I/O directly; all of that lives
//! behind the [`DurableStore`] and [`BlobStore`] trait objects passed in at
//! construction, per the rule that global singletons must be
//! passed as explicit dependencies").

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use challengectl_core::Challenge;
use challengectl_core::ChallengeConfigUpsert;
use challengectl_core::ChallengeId;
use challengectl_core::DashboardStats;
use challengectl_core::DisableOutcome;
use challengectl_core::DurableStore;
use challengectl_core::EnrollOutcome;
use challengectl_core::EnrollmentToken;
use challengectl_core::EnrollmentTokenRecord;
use challengectl_core::Event;
use challengectl_core::EventLog;
use challengectl_core::FrequencyRange;
use challengectl_core::MintEnrollmentTokenInput;
use challengectl_core::ReportCompleteInput;
use challengectl_core::ReportCompleteOutcome;
use challengectl_core::Runner;
use challengectl_core::RunnerId;
use challengectl_core::RunnerRegistration;
use challengectl_core::RunnerStatus;
use challengectl_core::StoreError;
use challengectl_core::Transmission;
use rand::Rng;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Number of random bytes used to build a plaintext runner API key.
const API_KEY_BYTES: usize = 32;
/// Bcrypt work factor applied to minted API keys.
const BCRYPT_COST: u32 = 12;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Failure modes raised by the Dispatch Core.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The underlying durable store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Hashing a newly minted API key failed.
    #[error("failed to hash api key: {0}")]
    Hashing(String),
}

// ============================================================================
// SECTION: DispatchCore
// ============================================================================

/// Orchestrates [`DurableStore`] operations and [`EventLog`] publication.
///
/// Holds both dependencies as trait objects so `challengectl-api`,
/// `challengectl-runner`'s embedded test doubles, and any future transport
/// never need to know the concrete store or event bus implementation.
#[derive(Clone)]
pub struct DispatchCore {
    store: Arc<dyn DurableStore>,
    events: Arc<dyn EventLog>,
}

impl DispatchCore {
    /// Builds a dispatch core over the given store and event sink.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, events: Arc<dyn EventLog>) -> Self {
        Self { store, events }
    }

    /// Upserts a runner row and marks it online.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn register_runner(&self, registration: RunnerRegistration) -> Result<Runner, DispatchError> {
        let runner = self.store.register_runner(registration).await?;
        self.events.publish(Event::RunnerStatus { runner_id: runner.id.clone(), status: runner.status });
        Ok(runner)
    }

    /// Records a heartbeat, promoting `offline` back to `online`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the runner is not registered.
    pub async fn heartbeat(&self, runner_id: &RunnerId) -> Result<(), DispatchError> {
        self.store.heartbeat(runner_id).await.map_err(Into::into)
    }

    /// Signs a runner out, clearing (as failed) any held assignment
    /// immediately with a synthetic `failure: shutdown` transmission.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn signout(&self, runner_id: &RunnerId) -> Result<(), DispatchError> {
        let outcome = self.store.signout(runner_id).await?;
        if let Some((transmission, _challenge_id)) = outcome.cleared_assignment {
            self.events.publish(Event::TransmissionComplete { transmission, synthetic_reason: Some("shutdown".to_owned()) });
        }
        self.events.publish(Event::RunnerStatus { runner_id: runner_id.clone(), status: RunnerStatus::Offline });
        Ok(())
    }

    /// Atomically assigns the best eligible challenge to `runner_id`, if any
    /// is eligible — the heart of mutual exclusion between runners.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn poll_task(&self, runner_id: &RunnerId, freq_caps: &[FrequencyRange]) -> Result<Option<Challenge>, DispatchError> {
        let assigned = self.store.assign_one(runner_id, freq_caps).await?;
        if let Some(challenge) = &assigned {
            self.events.publish(Event::ChallengeAssigned { challenge: challenge.clone() });
        }
        Ok(assigned)
    }

    /// Records a runner's completion report.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn report_complete(&self, input: ReportCompleteInput) -> Result<ReportCompleteOutcome, DispatchError> {
        let outcome = self.store.report_complete(input).await?;
        if let ReportCompleteOutcome::Recorded(transmission) = &outcome {
            self.events.publish(Event::TransmissionComplete { transmission: transmission.clone(), synthetic_reason: None });
        }
        Ok(outcome)
    }

    /// Forces a challenge's `next_tx_time` to now, idempotently promoting
    /// `waiting → queued`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the challenge does not exist.
    pub async fn trigger(&self, challenge_id: &ChallengeId) -> Result<(), DispatchError> {
        self.store.trigger(challenge_id).await.map_err(Into::into)
    }

    /// Enables a challenge for assignment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the challenge does not exist.
    pub async fn enable(&self, challenge_id: &ChallengeId) -> Result<(), DispatchError> {
        self.store.enable(challenge_id).await.map_err(Into::into)
    }

    /// Forces a challenge to `disabled`, clearing any assignment and
    /// emitting a best-effort `Disown` notice to the runner that held it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the challenge does not exist.
    pub async fn disable(&self, challenge_id: &ChallengeId) -> Result<DisableOutcome, DispatchError> {
        let outcome = self.store.disable(challenge_id).await?;
        if let Some(runner_id) = &outcome.disowned_runner {
            self.events.publish(Event::Disown { challenge_id: challenge_id.clone(), runner_id: runner_id.clone() });
        }
        Ok(outcome)
    }

    /// Diffs `upserts` against stored challenges by name.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn reload(&self, upserts: Vec<ChallengeConfigUpsert>) -> Result<(), DispatchError> {
        self.store.reload(upserts).await.map_err(Into::into)
    }

    /// Consumes an enrollment token and creates its runner, minting a fresh
    /// API key whose plaintext is returned exactly once.
    ///
    /// The plaintext key never reaches the durable store: only its bcrypt
    /// hash is persisted; only the one-way `api_key_hash` is stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the token was already consumed,
    /// unknown, or expired. Returns [`DispatchError::Hashing`] if the bcrypt
    /// work factor cannot be applied.
    pub async fn enroll(&self, token: &EnrollmentToken, runner_name: &str, mac: &str, machine_id: &str) -> Result<EnrollOutcome, DispatchError> {
        let plaintext = generate_api_key();
        let hash = hash_api_key(plaintext.clone()).await?;
        let outcome = self.store.enroll(token, runner_name, mac, machine_id, &hash).await?;
        let runner = self.store.get_runner(&outcome.runner_id).await?;
        self.events.publish(Event::RunnerStatus { runner_id: runner.id, status: runner.status });
        Ok(EnrollOutcome { runner_id: outcome.runner_id, api_key_plaintext: plaintext })
    }

    /// Mints a new one-time enrollment token (admin action).
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn mint_enrollment_token(&self, input: MintEnrollmentTokenInput) -> Result<EnrollmentTokenRecord, DispatchError> {
        self.store.mint_enrollment_token(input).await.map_err(Into::into)
    }

    /// Creates a new TOTP-verified admin session.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn create_admin_session(&self, user: &str, ttl_ms: i64) -> Result<String, DispatchError> {
        self.store.create_admin_session(user, ttl_ms).await.map_err(Into::into)
    }

    /// Resolves an admin session token to its owning username, if valid.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn validate_admin_session(&self, token: &str) -> Result<Option<String>, DispatchError> {
        self.store.validate_admin_session(token).await.map_err(Into::into)
    }

    /// Fetches a single challenge by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub async fn get_challenge(&self, challenge_id: &ChallengeId) -> Result<Challenge, DispatchError> {
        self.store.get_challenge(challenge_id).await.map_err(Into::into)
    }

    /// Lists every challenge.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn list_challenges(&self) -> Result<Vec<Challenge>, DispatchError> {
        self.store.list_challenges().await.map_err(Into::into)
    }

    /// Fetches a single runner by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if it does not exist.
    pub async fn get_runner(&self, runner_id: &RunnerId) -> Result<Runner, DispatchError> {
        self.store.get_runner(runner_id).await.map_err(Into::into)
    }

    /// Lists every runner.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn list_runners(&self) -> Result<Vec<Runner>, DispatchError> {
        self.store.list_runners().await.map_err(Into::into)
    }

    /// Lists every enabled runner, as verification candidates for principal
    /// resolution.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn list_enabled_runners(&self) -> Result<Vec<Runner>, DispatchError> {
        self.store.list_enabled_runners().await.map_err(Into::into)
    }

    /// Aggregated read-only dashboard counts.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn dashboard_stats(&self) -> Result<DashboardStats, DispatchError> {
        self.store.dashboard_stats().await.map_err(Into::into)
    }

    /// Marks runners whose heartbeat is stale as offline (the stale runner
    /// sweep). Exposed so [`crate::LivenessMonitor`] and tests can drive it
    /// directly; the monitor calls this on its own cadence.
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn sweep_stale_runners(&self, heartbeat_timeout_ms: i64) -> Result<Vec<RunnerId>, DispatchError> {
        let ids = self.store.sweep_stale_runners(heartbeat_timeout_ms).await?;
        for runner_id in &ids {
            self.events.publish(Event::RunnerStatus { runner_id: runner_id.clone(), status: RunnerStatus::Offline });
        }
        Ok(ids)
    }

    /// Requeues challenges whose assignment has expired (the stale
    /// assignment sweep).
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn sweep_stale_assignments(&self) -> Result<Vec<(Transmission, RunnerId)>, DispatchError> {
        let expired = self.store.sweep_stale_assignments().await?;
        for (transmission, _runner_id) in &expired {
            self.events.publish(Event::TransmissionComplete { transmission: transmission.clone(), synthetic_reason: Some("timeout".to_owned()) });
        }
        Ok(expired)
    }

    /// Deletes expired enrollment tokens and admin sessions (the expired
    /// token sweep).
    ///
    /// # Errors
    ///
    /// Propagates any [`StoreError`] from the underlying store.
    pub async fn sweep_expired_tokens(&self) -> Result<u64, DispatchError> {
        self.store.sweep_expired_tokens().await.map_err(Into::into)
    }
}

// ============================================================================
// SECTION: API Key Minting
// ============================================================================

/// Generates a fresh, high-entropy plaintext API key.
///
/// Exposed at crate root because `challengectl-api`'s enrollment handler
/// needs the same generator when composing its audit log entries around
/// [`DispatchCore::enroll`].
#[must_use]
pub fn generate_api_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; API_KEY_BYTES] = rng.gen();
    challengectl_core::core::hashing::hex_encode(&bytes)
}

async fn hash_api_key(plaintext: String) -> Result<String, DispatchError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(plaintext, BCRYPT_COST))
        .await
        .map_err(|err| DispatchError::Hashing(err.to_string()))?
        .map_err(|err| DispatchError::Hashing(err.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use std::sync::Arc;

    use challengectl_core::ChallengeConfig;
    use challengectl_core::ChallengeConfigUpsert;
    use challengectl_core::Device;
    use challengectl_core::DeviceId;
    use challengectl_core::FrequencyRange;
    use challengectl_core::FrequencySpec;
    use challengectl_core::MintEnrollmentTokenInput;
    use challengectl_core::RunnerRegistration;
    use challengectl_events::EventBus;
    use challengectl_store_sqlite::SqliteDurableStore;

    use super::*;

    async fn test_core() -> (DispatchCore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDurableStore::open(dir.path().join("t.sqlite3"), 300_000).await.expect("open store");
        let events = EventBus::new();
        (DispatchCore::new(Arc::new(store), Arc::new(events)), dir)
    }

    fn sample_config(priority: i64, hz: u64) -> ChallengeConfig {
        ChallengeConfig {
            modulation: "cw".to_owned(),
            frequency_spec: FrequencySpec::SingleHz { hz },
            files: vec![],
            delay_min_ms: 1_000,
            delay_max_ms: 1_000,
            priority,
            enabled: true,
            public_view: false,
        }
    }

    #[tokio::test]
    async fn poll_task_assigns_and_publishes_event() {
        let (core, _dir) = test_core().await;
        core.reload(vec![ChallengeConfigUpsert { name: "c1".to_owned(), config: sample_config(1, 146_550_000) }]).await.unwrap();
        let runner = core
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();

        let assigned = core.poll_task(&runner.id, &runner.capability_union()).await.unwrap();
        assert!(assigned.is_some());
    }

    #[tokio::test]
    async fn enroll_returns_plaintext_key_exactly_once() {
        let (core, _dir) = test_core().await;
        let token = core
            .mint_enrollment_token(MintEnrollmentTokenInput { runner_name: "r2".to_owned(), created_by: "admin".to_owned(), ttl_ms: 60_000, re_enrollment_for: None })
            .await
            .unwrap();
        let outcome = core.enroll(&token.token, "r2", "aa:cc", "m2").await.unwrap();
        assert!(!outcome.api_key_plaintext.is_empty());

        let second = core.enroll(&token.token, "r2", "aa:cc", "m2").await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn disable_emits_disown_when_assigned() {
        let (core, _dir) = test_core().await;
        core.reload(vec![ChallengeConfigUpsert { name: "c3".to_owned(), config: sample_config(1, 146_550_000) }]).await.unwrap();
        let runner = core
            .register_runner(RunnerRegistration {
                hostname: "r1".to_owned(),
                ip: "10.0.0.1".to_owned(),
                mac: "aa:bb".to_owned(),
                machine_id: "m1".to_owned(),
                devices: vec![Device { id: DeviceId::new("d1"), name: "hackrf".to_owned(), model: "HackRF".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
                api_key_hash: "hash".to_owned(),
            })
            .await
            .unwrap();
        let assigned = core.poll_task(&runner.id, &runner.capability_union()).await.unwrap().unwrap();
        let outcome = core.disable(&assigned.id).await.unwrap();
        assert_eq!(outcome.disowned_runner, Some(runner.id));
    }
}
