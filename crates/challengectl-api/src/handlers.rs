// crates/challengectl-api/src/handlers.rs
// ============================================================================
// Module: Control Plane API Handlers
// Description: One thin handler per spec.md §4.6/§6 operation.
// Purpose: Resolve a principal, call exactly one Dispatch Core / Blob Store
//          method, and map the result to an HTTP response.
// Dependencies: axum, challengectl-core, challengectl-dispatch
// ============================================================================

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::extract::Multipart;
use axum::extract::Path;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use challengectl_core::Challenge;
use challengectl_core::ChallengeConfig;
use challengectl_core::ChallengeConfigUpsert;
use challengectl_core::ChallengeId;
use challengectl_core::DashboardStats;
use challengectl_core::Device;
use challengectl_core::DeviceId;
use challengectl_core::EnrollmentToken;
use challengectl_core::FileDigest;
use challengectl_core::MintEnrollmentTokenInput;
use challengectl_core::Principal;
use challengectl_core::ReportCompleteInput;
use challengectl_core::ReportCompleteOutcome;
use challengectl_core::Runner;
use challengectl_core::RunnerId;
use challengectl_core::RunnerRegistration;
use challengectl_core::TransmissionStatus;
use serde::Deserialize;
use serde::Serialize;

use crate::auth::resolve_principal;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::events_ws_handler;

// ============================================================================
// SECTION: Router
// ============================================================================

/// Builds the full control plane router (spec.md §6's endpoint table).
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/enrollment/enroll", post(enroll))
        .route("/provisioning/mint-enrollment-token", post(mint_enrollment_token))
        .route("/agents/register", post(register_runner))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}/task", get(poll_task))
        .route("/agents/{id}/complete", post(report_complete))
        .route("/agents/{id}/signout", post(signout))
        .route("/files/{digest}", get(get_file))
        .route("/files", post(put_file))
        .route("/challenges", get(list_challenges))
        .route("/challenges/{id}/trigger", post(trigger_challenge))
        .route("/challenges/{id}/enable", post(enable_challenge))
        .route("/challenges/{id}/disable", post(disable_challenge))
        .route("/challenges/reload", post(reload_challenges))
        .route("/dashboard", get(dashboard))
        .route("/events", get(events_ws_handler))
        .with_state(state)
}

fn peer_addr(connect_info: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect_info.map(|ConnectInfo(addr)| addr.to_string())
}

fn require_runner_self(principal: &Principal, path_id: &str) -> Result<RunnerId, ApiError> {
    match principal {
        Principal::Runner(id) if id.as_str() == path_id => Ok(id.clone()),
        Principal::Runner(_) => Err(ApiError::Forbidden),
        _ => Err(ApiError::AuthFailed),
    }
}

fn require_admin(principal: &Principal) -> Result<String, ApiError> {
    match principal {
        Principal::Admin(user) => Ok(user.clone()),
        _ => Err(ApiError::AuthFailed),
    }
}

// ============================================================================
// SECTION: Enrollment & Provisioning
// ============================================================================

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    runner_name: String,
    mac: String,
    machine_id: String,
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    runner_id: RunnerId,
    api_key: String,
}

async fn enroll(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let Principal::Enrollment(token) = principal else {
        return Err(ApiError::AuthFailed);
    };
    let _permit = state.write_permits.try_acquire().map_err(|_| ApiError::Capacity)?;
    let outcome = state.dispatch.enroll(&token, &request.runner_name, &request.mac, &request.machine_id).await?;
    Ok(Json(EnrollResponse { runner_id: outcome.runner_id, api_key: outcome.api_key_plaintext }))
}

#[derive(Debug, Deserialize)]
struct MintTokenRequest {
    runner_name: String,
    ttl_ms: i64,
    #[serde(default)]
    re_enrollment_for: Option<RunnerId>,
}

#[derive(Debug, Serialize)]
struct MintTokenResponse {
    token: EnrollmentToken,
    expires_at_unix_ms: i64,
}

async fn mint_enrollment_token(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<MintTokenRequest>,
) -> Result<Json<MintTokenResponse>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    if !matches!(principal, Principal::Provisioning) {
        return Err(ApiError::AuthFailed);
    }
    let _permit = state.write_permits.try_acquire().map_err(|_| ApiError::Capacity)?;
    let record = state
        .dispatch
        .mint_enrollment_token(MintEnrollmentTokenInput { runner_name: request.runner_name, created_by: "provisioning".to_owned(), ttl_ms: request.ttl_ms, re_enrollment_for: request.re_enrollment_for })
        .await?;
    Ok(Json(MintTokenResponse { token: record.token, expires_at_unix_ms: record.expires_at.as_millis() }))
}

// ============================================================================
// SECTION: Agent Lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    hostname: String,
    ip: String,
    devices: Vec<Device>,
}

async fn register_runner(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Runner>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let Principal::Runner(runner_id) = principal else {
        return Err(ApiError::AuthFailed);
    };
    let existing = state.dispatch.get_runner(&runner_id).await?;
    let runner = state
        .dispatch
        .register_runner(RunnerRegistration { hostname: request.hostname, ip: request.ip, mac: existing.mac, machine_id: existing.machine_id, devices: request.devices, api_key_hash: existing.api_key_hash })
        .await?;
    Ok(Json(runner))
}

async fn heartbeat(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let runner_id = require_runner_self(&principal, &id)?;
    state.dispatch.heartbeat(&runner_id).await?;
    Ok(())
}

async fn poll_task(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<Json<Option<Challenge>>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let runner_id = require_runner_self(&principal, &id)?;
    let runner = state.dispatch.get_runner(&runner_id).await?;
    let assigned = state.dispatch.poll_task(&runner_id, &runner.capability_union()).await?;
    Ok(Json(assigned))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    challenge_id: ChallengeId,
    #[serde(default)]
    device_id: Option<DeviceId>,
    #[serde(default)]
    frequency_hz: Option<u64>,
    outcome: TransmissionStatus,
    #[serde(default)]
    error_message: Option<String>,
}

async fn report_complete(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>, Json(request): Json<CompleteRequest>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let runner_id = require_runner_self(&principal, &id)?;
    let outcome = state
        .dispatch
        .report_complete(ReportCompleteInput { runner_id, challenge_id: request.challenge_id, device_id: request.device_id, frequency_hz: request.frequency_hz, outcome: request.outcome, error_message: request.error_message })
        .await?;
    match outcome {
        ReportCompleteOutcome::Recorded(_) => Ok(()),
        ReportCompleteOutcome::StaleAssignment(_) => Err(ApiError::StaleAssignment),
    }
}

async fn signout(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let runner_id = require_runner_self(&principal, &id)?;
    state.dispatch.signout(&runner_id).await?;
    Ok(())
}

// ============================================================================
// SECTION: Files
// ============================================================================

async fn get_file(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(digest): Path<String>) -> Result<Response, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    if !matches!(principal, Principal::Runner(_) | Principal::Admin(_)) {
        return Err(ApiError::AuthFailed);
    }
    let digest = FileDigest::new(digest);
    let stream = state.blobs.get(&digest).await?;
    Ok(Body::from_stream(stream).into_response())
}

#[derive(Debug, Serialize)]
struct PutFileResponse {
    digest: FileDigest,
}

async fn put_file(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, mut multipart: Multipart) -> Result<Json<PutFileResponse>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    let _permit = state.write_permits.try_acquire().map_err(|_| ApiError::Capacity)?;

    let mut filename = String::from("upload.bin");
    let mut mime_type = String::from("application/octet-stream");
    let mut content: Option<bytes::Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| ApiError::BadRequest(err.to_string()))? {
        if let Some(name) = field.file_name() {
            filename = name.to_owned();
        }
        if let Some(mime) = field.content_type() {
            mime_type = mime.to_owned();
        }
        content = Some(field.bytes().await.map_err(|err| ApiError::BadRequest(err.to_string()))?);
    }
    let bytes = content.ok_or_else(|| ApiError::BadRequest("no file field present".to_owned()))?;
    let digest = state.blobs.put(&bytes).await?;
    state.blobs.register(&filename, &digest, bytes.len() as u64, &mime_type).await?;
    Ok(Json(PutFileResponse { digest }))
}

// ============================================================================
// SECTION: Challenges
// ============================================================================

async fn list_challenges(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap) -> Result<Json<Vec<Challenge>>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    Ok(Json(state.dispatch.list_challenges().await?))
}

async fn trigger_challenge(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    state.dispatch.trigger(&ChallengeId::new(id)).await?;
    Ok(())
}

async fn enable_challenge(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    state.dispatch.enable(&ChallengeId::new(id)).await?;
    Ok(())
}

async fn disable_challenge(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Path(id): Path<String>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    state.dispatch.disable(&ChallengeId::new(id)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChallengeUpsertWire {
    name: String,
    config: ChallengeConfig,
}

async fn reload_challenges(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap, Json(request): Json<Vec<ChallengeUpsertWire>>) -> Result<(), ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    require_admin(&principal)?;
    let upserts = request.into_iter().map(|wire| ChallengeConfigUpsert { name: wire.name, config: wire.config }).collect();
    state.dispatch.reload(upserts).await?;
    Ok(())
}

// ============================================================================
// SECTION: Dashboard
// ============================================================================

async fn dashboard(State(state): State<AppState>, connect_info: Option<ConnectInfo<SocketAddr>>, headers: HeaderMap) -> Result<Json<DashboardStats>, ApiError> {
    let principal = resolve_principal(&headers, peer_addr(connect_info), &state).await?;
    let stats = state.dispatch.dashboard_stats().await?;
    match principal {
        Principal::Admin(_) => Ok(Json(stats)),
        Principal::Anonymous if !stats.public_challenge_names.is_empty() => Ok(Json(stats)),
        Principal::Anonymous => Err(ApiError::Forbidden),
        _ => Err(ApiError::AuthFailed),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use std::sync::Arc;

    use challengectl_blobstore::LocalBlobStore;
    use challengectl_core::FrequencyRange;
    use challengectl_core::FrequencySpec;
    use challengectl_dispatch::DispatchCore;
    use challengectl_events::EventBus;
    use challengectl_store_sqlite::SqliteDurableStore;
    use http_body_util::BodyExt as _;
    use tower::ServiceExt as _;

    use super::*;

    async fn test_app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteDurableStore::open(dir.path().join("t.sqlite3"), 300_000).await.expect("open store");
        let blobs = LocalBlobStore::open(dir.path().join("blobs")).await.expect("blob store");
        let events = Arc::new(EventBus::new());
        let dispatch = Arc::new(DispatchCore::new(Arc::new(store), Arc::clone(&events) as Arc<dyn challengectl_core::EventLog>));
        let provisioning_hash = bcrypt::hash("provisioning-secret", 4).expect("hash");
        let state = AppState::new(dispatch, Arc::new(blobs), events, provisioning_hash);
        (build_router(state), dir)
    }

    #[tokio::test]
    async fn dashboard_rejects_anonymous_with_no_public_challenges() {
        let (app, _dir) = test_app().await;
        let response = app.oneshot(axum::http::Request::builder().uri("/dashboard").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn mint_token_requires_provisioning_bearer() {
        let (app, _dir) = test_app().await;
        let body = serde_json::to_vec(&serde_json::json!({"runner_name": "r1", "ttl_ms": 60_000})).unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/provisioning/mint-enrollment-token")
                    .header("authorization", "Bearer provisioning-secret")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed["token"].is_string());
    }

    #[tokio::test]
    async fn enroll_then_register_then_poll_task() {
        let (app, _dir) = test_app().await;

        let mint_body = serde_json::to_vec(&serde_json::json!({"runner_name": "agent-1", "ttl_ms": 60_000})).unwrap();
        let mint_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/provisioning/mint-enrollment-token")
                    .header("authorization", "Bearer provisioning-secret")
                    .header("content-type", "application/json")
                    .body(Body::from(mint_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let mint_bytes = mint_response.into_body().collect().await.unwrap().to_bytes();
        let mint_parsed: serde_json::Value = serde_json::from_slice(&mint_bytes).unwrap();
        let token = mint_parsed["token"].as_str().unwrap().to_owned();

        let enroll_body = serde_json::to_vec(&serde_json::json!({"runner_name": "agent-1", "mac": "aa:bb:cc", "machine_id": "m-1"})).unwrap();
        let enroll_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/enrollment/enroll")
                    .header("authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from(enroll_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(enroll_response.status(), axum::http::StatusCode::OK);
        let enroll_bytes = enroll_response.into_body().collect().await.unwrap().to_bytes();
        let enroll_parsed: serde_json::Value = serde_json::from_slice(&enroll_bytes).unwrap();
        let runner_id = enroll_parsed["runner_id"].as_str().unwrap().to_owned();
        let api_key = enroll_parsed["api_key"].as_str().unwrap().to_owned();

        let register_body = serde_json::to_vec(&serde_json::json!({
            "hostname": "box1",
            "ip": "10.0.0.5",
            "devices": [{"id": "dev-1", "name": "hackrf", "model": "HackRF One", "frequency_limits": [{"low_hz": 144_000_000_u64, "high_hz": 148_000_000_u64}]}],
        }))
        .unwrap();
        let register_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/agents/register")
                    .header("authorization", format!("Bearer {api_key}"))
                    .header("x-runner-mac", "aa:bb:cc")
                    .header("content-type", "application/json")
                    .body(Body::from(register_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(register_response.status(), axum::http::StatusCode::OK);

        let task_response = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri(format!("/agents/{runner_id}/task"))
                    .header("authorization", format!("Bearer {api_key}"))
                    .header("x-runner-mac", "aa:bb:cc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(task_response.status(), axum::http::StatusCode::OK);
    }
}
