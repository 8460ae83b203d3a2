// crates/challengectl-runner/src/agent.rs
// ============================================================================
// Module: Runner Agent Loop
// Description: The full runner agent lifecycle (spec.md §4.8, C8): resolve
//              or mint an identity, register, heartbeat, poll for work,
//              sync files, transmit, and report.
// Purpose: Tie the client, cache, and subprocess modules together into the
//          one long-lived task a runner host actually supervises.
// Dependencies: challengectl-config, challengectl-core, serde_json, tokio
// ============================================================================

//! ## Overview
//! The agent's background structure mirrors `challengectl-dispatch`'s
//! [`challengectl_dispatch::LivenessMonitor`]: an explicit start/stop/join
//! lifecycle built from an `AtomicBool` running flag, a `tokio::time::interval`
//! with `MissedTickBehavior::Skip`, and a `tokio::sync::watch` shutdown
//! signal, rather than a detached fire-and-forget `tokio::spawn`. The
//! heartbeat task and the poll/transmit loop are two independently
//! shut-downable tasks joined by [`RunnerAgentHandle::shutdown`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use challengectl_config::RunnerConfig;
use challengectl_core::Challenge;
use challengectl_core::RunnerId;
use challengectl_core::TransmissionStatus;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::resolve_files;
use crate::cache::FileCache;
use crate::client::CompleteInput;
use crate::client::ControllerClient;
use crate::error::RunnerError;
use crate::log::RunnerLog;
use crate::subprocess::expand_argv;
use crate::subprocess::run as run_subprocess;
use crate::subprocess::TransmitContext;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Modulation name reserved for the spectrum-paint waveform itself. A
/// challenge whose own modulation is this kind never gets a redundant paint
/// pre-pass (spec.md §4.8: "if enabled and the modulation is not itself
/// paint").
const PAINT_MODULATION: &str = "paint";

// ============================================================================
// SECTION: Persisted Identity
// ============================================================================

/// The enrollment result persisted to `api_key_path`, so a restarted agent
/// never re-enrolls as long as the file survives.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedIdentity {
    runner_id: RunnerId,
    api_key: String,
}

// ============================================================================
// SECTION: RunnerAgent
// ============================================================================

/// The runner agent: owns the controller client, file cache, and its own
/// resolved identity.
pub struct RunnerAgent {
    config: RunnerConfig,
    client: ControllerClient,
    cache: FileCache,
    log: Arc<dyn RunnerLog>,
}

impl RunnerAgent {
    /// Builds an agent from a validated [`RunnerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if the HTTP client cannot be built or the
    /// local cache directory cannot be created.
    pub async fn new(config: RunnerConfig, log: Arc<dyn RunnerLog>) -> Result<Self, RunnerError> {
        let client = ControllerClient::new(config.controller_base_url.clone(), config.mac.clone(), config.machine_id.clone(), Arc::clone(&log))?;
        let cache = FileCache::open(config.cache_dir.clone()).await?;
        Ok(Self { config, client, cache, log })
    }

    /// Resolves the runner's identity: loads a persisted API key if present,
    /// otherwise enrolls with the configured enrollment token. Either way,
    /// installs the key on [`Self::client`] and returns the runner id.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::AuthFailed`] if no API key is cached and no
    /// enrollment token is configured, or if enrollment itself is rejected.
    async fn ensure_identity(&self) -> Result<RunnerId, RunnerError> {
        if let Some(identity) = self.load_identity().await {
            self.client.set_api_key(identity.api_key).await;
            return Ok(identity.runner_id);
        }

        let token = self.config.enrollment_token.as_deref().ok_or(RunnerError::AuthFailed)?;
        let result = self.client.enroll(token, &self.config.hostname).await?;
        self.client.set_api_key(result.api_key.clone()).await;
        self.persist_identity(&PersistedIdentity { runner_id: result.runner_id.clone(), api_key: result.api_key }).await?;
        Ok(result.runner_id)
    }

    async fn load_identity(&self) -> Option<PersistedIdentity> {
        let bytes = tokio::fs::read(&self.config.api_key_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn persist_identity(&self, identity: &PersistedIdentity) -> Result<(), RunnerError> {
        let bytes = serde_json::to_vec_pretty(identity).map_err(|err| RunnerError::Decode(err.to_string()))?;
        tokio::fs::write(&self.config.api_key_path, bytes).await?;
        Ok(())
    }

    /// Runs one poll-sync-transmit-report cycle. Returns `Ok(true)` if a
    /// challenge was assigned and handled (regardless of transmit outcome),
    /// `Ok(false)` if no challenge was available.
    async fn run_cycle(&self, runner_id: &RunnerId) -> Result<bool, RunnerError> {
        let Some(challenge) = self.client.poll_task(runner_id).await? else {
            return Ok(false);
        };

        match self.handle_challenge(runner_id, &challenge).await {
            Ok(()) => {}
            Err(RunnerError::StaleAssignment) => self.log.stale_assignment(&challenge.id),
            Err(err) => return Err(err),
        }
        Ok(true)
    }

    async fn handle_challenge(&self, runner_id: &RunnerId, challenge: &Challenge) -> Result<(), RunnerError> {
        // The controller already selected a frequency from this runner's own
        // capability union (handlers::poll_task passes runner.capability_union()
        // to assign_one), so assigned_frequency_hz is expected to be set
        // whenever status is assigned. A missing value is reported as a
        // failed attempt rather than guessed at locally.
        let assigned_freq = challenge.assigned_frequency_hz;
        let device = assigned_freq.and_then(|hz| self.config.devices.iter().find(|device| device.covers(hz)));

        let device_id = device.map(|device| device.id.clone());
        let device_label = device.map_or("unknown", |device| device.id.as_str());

        let files = resolve_files(&self.cache, &self.client, &self.config.working_dir, &challenge.config.files).await;

        let (outcome, error_message) = match (assigned_freq, files) {
            (None, _) => (TransmissionStatus::Failure, Some("no frequency assigned".to_owned())),
            (_, Err(err)) => (TransmissionStatus::Failure, Some(err.to_string())),
            (Some(hz), Ok(files)) => match self.transmit(hz, device_label, &challenge.config.modulation, &files).await {
                Ok(()) => (TransmissionStatus::Success, None),
                Err(err) => (TransmissionStatus::Failure, Some(err.to_string())),
            },
        };

        self.log.transmission_finished(&challenge.id, matches!(outcome, TransmissionStatus::Success), error_message.as_deref().unwrap_or("ok"));

        self.client
            .report_complete(runner_id, CompleteInput { challenge_id: challenge.id.clone(), device_id, frequency_hz: assigned_freq, outcome, error_message })
            .await
    }

    async fn transmit(&self, freq_hz: u64, device: &str, modulation: &str, files: &[PathBuf]) -> Result<(), RunnerError> {
        let ctx = TransmitContext { freq_hz, device, modulation, files };

        if modulation != PAINT_MODULATION {
            if let Some(paint_template) = &self.config.spectrum_paint_command {
                let argv = expand_argv(paint_template, &ctx);
                run_subprocess(argv, &self.config.working_dir).await?;
            }
        }

        let argv = expand_argv(&self.config.transmit_command, &ctx);
        run_subprocess(argv, &self.config.working_dir).await
    }

    /// Starts the agent: resolves identity, registers, then spawns the
    /// heartbeat and poll/transmit loops as independently joinable tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if identity resolution or the initial
    /// registration call fails.
    pub async fn spawn(self: Arc<Self>) -> Result<RunnerAgentHandle, RunnerError> {
        let runner_id = self.ensure_identity().await?;
        self.client.register(&self.config.hostname, &self.config.ip, &self.config.devices).await?;
        self.log.registered(&runner_id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let heartbeat_handle = {
            let agent = Arc::clone(&self);
            let runner_id = runner_id.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut running = true;
                let mut ticker = tokio::time::interval(agent.config.tunables.heartbeat_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut attempt: u32 = 0;
                while running {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = agent.client.heartbeat(&runner_id).await {
                                attempt += 1;
                                agent.log.heartbeat_failed(attempt, &err.to_string());
                            } else {
                                attempt = 0;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            running = false;
                        }
                    }
                }
            })
        };

        let main_handle = {
            let agent = Arc::clone(&self);
            let runner_id = runner_id.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut running = true;
                let mut ticker = tokio::time::interval(agent.config.tunables.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                while running {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = agent.run_cycle(&runner_id).await {
                                if err.is_fatal() {
                                    agent.log.fatal(&err.to_string());
                                    running = false;
                                }
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            running = false;
                        }
                    }
                }
            })
        };

        Ok(RunnerAgentHandle { agent: self, runner_id, shutdown_tx, heartbeat_handle, main_handle })
    }
}

// ============================================================================
// SECTION: RunnerAgentHandle
// ============================================================================

/// A running [`RunnerAgent`]'s background tasks, with an explicit shutdown
/// sequence: signal both loops, join them, then sign out.
pub struct RunnerAgentHandle {
    agent: Arc<RunnerAgent>,
    runner_id: RunnerId,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_handle: JoinHandle<()>,
    main_handle: JoinHandle<()>,
}

impl RunnerAgentHandle {
    /// Signals both background loops to stop, joins them, then signs the
    /// runner out with the controller. Errors from signout are logged
    /// rather than propagated, since the process is exiting regardless.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.heartbeat_handle.await;
        let _ = self.main_handle.await;
        if let Err(err) = self.agent.client.signout(&self.runner_id).await {
            self.agent.log.fatal(&format!("signout failed during shutdown: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use std::sync::Arc;

    use challengectl_core::Device;
    use challengectl_core::FrequencyRange;

    use super::*;
    use crate::log::NoopRunnerLog;

    fn test_config(cache_dir: PathBuf, api_key_path: PathBuf) -> RunnerConfig {
        RunnerConfig {
            controller_base_url: "http://127.0.0.1:0".to_owned(),
            api_key_path,
            enrollment_token: None,
            cache_dir,
            hostname: "runner-host".to_owned(),
            ip: "10.0.0.9".to_owned(),
            mac: "aa:bb:cc:dd:ee:ff".to_owned(),
            machine_id: "machine-1".to_owned(),
            devices: vec![Device { id: challengectl_core::DeviceId::new("dev-1"), name: "hackrf-0".to_owned(), model: "HackRF One".to_owned(), frequency_limits: vec![FrequencyRange::new(144_000_000, 148_000_000)] }],
            transmit_command: vec!["true".to_owned()],
            spectrum_paint_command: None,
            working_dir: PathBuf::from("."),
            tunables: challengectl_config::Tunables {
                poll_interval: std::time::Duration::from_secs(10),
                heartbeat_interval: std::time::Duration::from_secs(30),
                heartbeat_timeout: std::time::Duration::from_secs(90),
                assignment_ttl: std::time::Duration::from_secs(300),
                stale_sweep_interval: std::time::Duration::from_secs(30),
                expired_token_sweep_interval: std::time::Duration::from_secs(60),
                session_timeout: std::time::Duration::from_secs(86_400),
            },
        }
    }

    #[tokio::test]
    async fn ensure_identity_fails_closed_with_no_key_and_no_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path().join("cache"), dir.path().join("missing.key"));
        let agent = RunnerAgent::new(config, Arc::new(NoopRunnerLog)).await.expect("build agent");
        let result = agent.ensure_identity().await;
        assert!(matches!(result, Err(RunnerError::AuthFailed)));
    }

    #[tokio::test]
    async fn ensure_identity_loads_persisted_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("agent.key");
        let identity = PersistedIdentity { runner_id: RunnerId::new("r-1"), api_key: "secret".to_owned() };
        tokio::fs::write(&key_path, serde_json::to_vec(&identity).unwrap()).await.unwrap();

        let config = test_config(dir.path().join("cache"), key_path);
        let agent = RunnerAgent::new(config, Arc::new(NoopRunnerLog)).await.expect("build agent");
        let runner_id = agent.ensure_identity().await.expect("loads persisted identity");
        assert_eq!(runner_id, RunnerId::new("r-1"));
        assert_eq!(agent.client.api_key().await.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn handle_challenge_picks_device_covering_assigned_frequency() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path().join("cache"), dir.path().join("agent.key"));
        let agent = RunnerAgent::new(config, Arc::new(NoopRunnerLog)).await.expect("build agent");

        let device = agent.config.devices.iter().find(|device| device.covers(146_000_000));
        assert!(device.is_some());
        assert!(!agent.config.devices.iter().any(|device| device.covers(900_000_000)));
    }

    #[tokio::test]
    async fn transmit_runs_paint_prepass_for_non_paint_modulation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("painted");
        let mut config = test_config(dir.path().join("cache"), dir.path().join("agent.key"));
        config.spectrum_paint_command = Some(vec!["touch".to_owned(), marker.to_string_lossy().into_owned()]);
        let agent = RunnerAgent::new(config, Arc::new(NoopRunnerLog)).await.expect("build agent");

        agent.transmit(146_550_000, "dev-1", "cw", &[]).await.expect("transmit succeeds");
        assert!(marker.exists(), "paint pre-pass should run ahead of a non-paint transmit");
    }

    #[tokio::test]
    async fn transmit_skips_paint_prepass_when_modulation_is_paint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("painted");
        let mut config = test_config(dir.path().join("cache"), dir.path().join("agent.key"));
        config.spectrum_paint_command = Some(vec!["touch".to_owned(), marker.to_string_lossy().into_owned()]);
        let agent = RunnerAgent::new(config, Arc::new(NoopRunnerLog)).await.expect("build agent");

        agent.transmit(146_550_000, "dev-1", PAINT_MODULATION, &[]).await.expect("transmit succeeds");
        assert!(!marker.exists(), "a paint-modulation challenge must not trigger its own pre-pass");
    }
}
