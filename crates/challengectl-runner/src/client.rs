// crates/challengectl-runner/src/client.rs
// ============================================================================
// Module: Controller Client
// Description: A thin, retrying HTTP client over `challengectl-api`'s
//              control plane contract (spec.md §6, §4.8).
// Purpose: Give the agent loop one call per Dispatch Core operation it is
//          allowed to invoke, without ever touching the controller's storage
//          directly.
// Dependencies: bytes, challengectl-core, reqwest, serde_json, tokio
// ============================================================================

//! ## Overview
//! Every authenticated call attaches `Authorization: Bearer <api_key>` plus
//! `x-runner-mac` and `x-runner-machine-id` headers, exactly as
//! `challengectl-api::auth::resolve_principal` expects. Calls whose failure
//! is [`RunnerError::is_retryable`] are retried with capped exponential
//! backoff; everything else (auth failures, stale assignments, not-found)
//! propagates on the first attempt, matching spec.md §4.8's instruction that
//! a runner never silently reattempts a stale assignment as if it still held
//! it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use challengectl_core::Challenge;
use challengectl_core::Device;
use challengectl_core::Runner;
use challengectl_core::RunnerId;
use challengectl_core::TransmissionStatus;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::RunnerError;
use crate::log::RunnerLog;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum number of attempts for a retryable operation, including the first.
const MAX_ATTEMPTS: u32 = 5;
/// Base delay for exponential backoff between retries.
const BASE_BACKOFF: Duration = Duration::from_millis(250);
/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// SECTION: Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct EnrollRequest<'a> {
    runner_name: &'a str,
    mac: &'a str,
    machine_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    runner_id: RunnerId,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    hostname: &'a str,
    ip: &'a str,
    devices: &'a [Device],
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    challenge_id: &'a challengectl_core::ChallengeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<&'a challengectl_core::DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_hz: Option<u64>,
    outcome: TransmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<&'a str>,
}

/// Outcome of [`ControllerClient::enroll`]: the identity and key a runner
/// persists locally for every subsequent call.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    /// The identity assigned by the controller.
    pub runner_id: RunnerId,
    /// The plaintext API key; the caller is responsible for storing it.
    pub api_key: String,
}

/// Input to [`ControllerClient::report_complete`].
#[derive(Debug, Clone)]
pub struct CompleteInput {
    /// Challenge the runner believed it was assigned.
    pub challenge_id: challengectl_core::ChallengeId,
    /// Device actually used, if selection succeeded.
    pub device_id: Option<challengectl_core::DeviceId>,
    /// Frequency actually used, if selection succeeded.
    pub frequency_hz: Option<u64>,
    /// Whether the transmit callable succeeded.
    pub outcome: TransmissionStatus,
    /// Present when `outcome = Failure`.
    pub error_message: Option<String>,
}

// ============================================================================
// SECTION: ControllerClient
// ============================================================================

/// HTTP client for the runner agent's side of the control plane contract.
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: RwLock<Option<String>>,
    mac: String,
    machine_id: String,
    log: Arc<dyn RunnerLog>,
}

impl ControllerClient {
    /// Builds a client with no API key set yet; call [`Self::enroll`] or
    /// [`Self::set_api_key`] before any authenticated call.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Transport`] if the underlying `reqwest::Client`
    /// could not be built (e.g. TLS backend initialization failure).
    pub fn new(base_url: impl Into<String>, mac: impl Into<String>, machine_id: impl Into<String>, log: Arc<dyn RunnerLog>) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http, base_url: base_url.into(), api_key: RwLock::new(None), mac: mac.into(), machine_id: machine_id.into(), log })
    }

    /// Installs an already-known API key, skipping enrollment.
    pub async fn set_api_key(&self, api_key: String) {
        *self.api_key.write().await = Some(api_key);
    }

    /// Returns the currently installed API key, if any.
    pub async fn api_key(&self) -> Option<String> {
        self.api_key.read().await.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, RunnerError> {
        let key = self.api_key.read().await.clone().ok_or(RunnerError::AuthFailed)?;
        Ok(builder.bearer_auth(key).header("x-runner-mac", self.mac.clone()).header("x-runner-machine-id", self.machine_id.clone()))
    }

    /// Exchanges a one-time enrollment token for a durable runner identity
    /// and API key (spec.md §4.8 step 1; POST `/enrollment/enroll`).
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::AuthFailed`] if the token is unknown, already
    /// used, or expired. Not retried.
    pub async fn enroll(&self, enrollment_token: &str, runner_name: &str) -> Result<EnrollResult, RunnerError> {
        let request = self.http.post(self.url("/enrollment/enroll")).bearer_auth(enrollment_token).json(&EnrollRequest { runner_name, mac: &self.mac, machine_id: &self.machine_id });
        let body: EnrollResponse = send_once(request).await?;
        Ok(EnrollResult { runner_id: body.runner_id, api_key: body.api_key })
    }

    /// Registers (or re-registers) the runner's hostname, IP, and device
    /// capabilities (POST `/agents/register`). Retried on transient failure.
    pub async fn register(&self, hostname: &str, ip: &str, devices: &[Device]) -> Result<Runner, RunnerError> {
        self.with_retry("register", || async {
            let builder = self.http.post(self.url("/agents/register")).json(&RegisterRequest { hostname, ip, devices });
            let builder = self.authorized(builder).await?;
            send_once(builder).await
        })
        .await
    }

    /// Sends a heartbeat for `runner_id` (POST `/agents/{id}/heartbeat`).
    /// Retried on transient failure.
    pub async fn heartbeat(&self, runner_id: &RunnerId) -> Result<(), RunnerError> {
        self.with_retry("heartbeat", || async {
            let builder = self.http.post(self.url(&format!("/agents/{runner_id}/heartbeat")));
            let builder = self.authorized(builder).await?;
            send_empty(builder).await
        })
        .await
    }

    /// Polls for an assigned challenge (GET `/agents/{id}/task`). Retried on
    /// transient failure; a `None` body means no work is currently assigned.
    pub async fn poll_task(&self, runner_id: &RunnerId) -> Result<Option<Challenge>, RunnerError> {
        self.with_retry("poll_task", || async {
            let builder = self.http.get(self.url(&format!("/agents/{runner_id}/task")));
            let builder = self.authorized(builder).await?;
            send_once(builder).await
        })
        .await
    }

    /// Reports the outcome of a transmission attempt (POST
    /// `/agents/{id}/complete`). Not retried on
    /// [`RunnerError::StaleAssignment`] — the caller is expected to drop the
    /// assignment and poll again rather than reattempt the same report.
    pub async fn report_complete(&self, runner_id: &RunnerId, input: CompleteInput) -> Result<(), RunnerError> {
        self.with_retry("report_complete", || async {
            let body = CompleteRequest {
                challenge_id: &input.challenge_id,
                device_id: input.device_id.as_ref(),
                frequency_hz: input.frequency_hz,
                outcome: input.outcome,
                error_message: input.error_message.as_deref(),
            };
            let builder = self.http.post(self.url(&format!("/agents/{runner_id}/complete"))).json(&body);
            let builder = self.authorized(builder).await?;
            send_empty(builder).await
        })
        .await
    }

    /// Signs the runner out (POST `/agents/{id}/signout`), called once on
    /// graceful shutdown. Retried on transient failure, but only once the
    /// caller's own shutdown deadline allows; callers should bound how long
    /// they wait for this to succeed.
    pub async fn signout(&self, runner_id: &RunnerId) -> Result<(), RunnerError> {
        self.with_retry("signout", || async {
            let builder = self.http.post(self.url(&format!("/agents/{runner_id}/signout")));
            let builder = self.authorized(builder).await?;
            send_empty(builder).await
        })
        .await
    }

    /// Downloads the full content of a content-addressed file (GET
    /// `/files/{digest}`). Retried on transient failure; the caller is
    /// responsible for verifying the digest of the returned bytes.
    pub async fn get_file(&self, digest: &challengectl_core::FileDigest) -> Result<bytes::Bytes, RunnerError> {
        self.with_retry("get_file", || async {
            let builder = self.http.get(self.url(&format!("/files/{digest}")));
            let builder = self.authorized(builder).await?;
            let response = builder.send().await?;
            let status = response.status();
            if status.is_success() {
                Ok(response.bytes().await?)
            } else {
                let body = response.text().await.unwrap_or_default();
                Err(RunnerError::from_response(status, &body))
            }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RunnerError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RunnerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                    self.log.retrying(operation, attempt, &err.to_string());
                    tokio::time::sleep(BASE_BACKOFF * 2_u32.pow(attempt - 1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn send_once<T: for<'de> Deserialize<'de>>(builder: reqwest::RequestBuilder) -> Result<T, RunnerError> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_success() {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| RunnerError::Decode(err.to_string()))
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(RunnerError::from_response(status, &body))
    }
}

async fn send_empty(builder: reqwest::RequestBuilder) -> Result<(), RunnerError> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(RunnerError::from_response(status, &body))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions")]
    use super::*;
    use crate::log::NoopRunnerLog;

    #[tokio::test]
    async fn new_client_has_no_api_key() {
        let client = ControllerClient::new("http://127.0.0.1:0", "aa:bb:cc", "m-1", Arc::new(NoopRunnerLog)).unwrap();
        assert!(client.api_key().await.is_none());
    }

    #[tokio::test]
    async fn set_api_key_round_trips() {
        let client = ControllerClient::new("http://127.0.0.1:0", "aa:bb:cc", "m-1", Arc::new(NoopRunnerLog)).unwrap();
        client.set_api_key("secret-key".to_owned()).await;
        assert_eq!(client.api_key().await.as_deref(), Some("secret-key"));
    }

    #[tokio::test]
    async fn authorized_without_api_key_fails_closed() {
        let client = ControllerClient::new("http://127.0.0.1:0", "aa:bb:cc", "m-1", Arc::new(NoopRunnerLog)).unwrap();
        let builder = client.http.get(client.url("/agents/r1/task"));
        let result = client.authorized(builder).await;
        assert!(matches!(result, Err(RunnerError::AuthFailed)));
    }

    #[test]
    fn url_joins_base_and_path_without_double_slash() {
        let client = ControllerClient::new("http://localhost:8080/", "aa", "m", Arc::new(NoopRunnerLog)).unwrap();
        assert_eq!(client.url("/agents/r1/task"), "http://localhost:8080/agents/r1/task");
    }
}
