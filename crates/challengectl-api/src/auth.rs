// crates/challengectl-api/src/auth.rs
// ============================================================================
// Module: Principal Resolver (C3)
// Description: Maps an inbound request's credentials to a principal.
// Purpose: The single place every handler asks "who is calling, and under
//          what authority" — never re-implemented per-endpoint.
// Dependencies: bcrypt, challengectl-core, sha2, subtle, tokio
// ============================================================================

//! ## Overview
//! Rules are evaluated in a fixed order, first match wins. Every comparison against secret material is either bcrypt
//! (for hashed keys) or `subtle::ConstantTimeEq` (for raw strings), and the
//! bcrypt path always runs at least once per request — against a fixed dummy
//! hash when no runner's key could possibly match — so response latency does
//! not leak whether a presented key belongs to a known runner.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::OnceLock;

use axum::http::HeaderMap;
use challengectl_core::AuthAuditEvent;
use challengectl_core::EnrollmentToken;
use challengectl_core::Principal;
use challengectl_core::RunnerId;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Bcrypt work factor for the fixed dummy hash used to equalize timing.
const DUMMY_BCRYPT_COST: u32 = 12;
/// Passphrase hashed once at process start to build the dummy comparison
/// target; never compared against any real secret.
const DUMMY_PASSPHRASE: &str = "challengectl-timing-oracle-guard";

static DUMMY_HASH: OnceLock<String> = OnceLock::new();

fn dummy_hash() -> &'static str {
    DUMMY_HASH.get_or_init(|| bcrypt::hash(DUMMY_PASSPHRASE, DUMMY_BCRYPT_COST).unwrap_or_else(|_| "$2b$12$CwTycUXWue0Thq9StjUM0uJ8qIm1NWyY1PNj0rjbLCpA2/AG5yBlu".to_owned()))
}

// ============================================================================
// SECTION: Header Extraction
// ============================================================================

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::to_owned)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    let cookie_header = header_str(headers, axum::http::header::COOKIE.as_str())?;
    cookie_header.split(';').map(str::trim).find_map(|part| part.strip_prefix("challengectl_session=")).map(str::to_owned)
}

fn constant_time_matches(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn token_fingerprint(token: &str) -> String {
    challengectl_core::sha256_hex(token.as_bytes()).into_inner()
}

// ============================================================================
// SECTION: Resolution
// ============================================================================

/// Resolves `headers` to a [`Principal`] by the fixed rule order above,
/// recording the outcome (allow or deny) through `state.audit` regardless of
/// the result.
///
/// # Errors
///
/// Returns [`ApiError::AuthFailed`] when a bearer token is present but every
/// rule rejects it (rule 1's "reject, do not downgrade to anonymous" case).
/// Never fails for an absent bearer token; that resolves to
/// [`Principal::Anonymous`].
pub async fn resolve_principal(headers: &HeaderMap, peer_addr: Option<String>, state: &AppState) -> Result<Principal, ApiError> {
    if let Some(token) = bearer_token(headers) {
        let fingerprint = Some(token_fingerprint(&token));

        let runners = state.dispatch.list_enabled_runners().await.unwrap_or_default();
        let mut matched_runner: Option<RunnerId> = None;
        for runner in &runners {
            if verify_bcrypt(&token, &runner.api_key_hash).await {
                matched_runner = Some(runner.id.clone());
                break;
            }
        }
        if matched_runner.is_none() {
            // Run the dummy comparison so an unknown key costs the same as a
            // known-runner, wrong-key request.
            let _ = verify_bcrypt(&token, dummy_hash()).await;
        }

        if let Some(runner_id) = matched_runner {
            let runner = runners.iter().find(|runner| runner.id == runner_id).ok_or(ApiError::AuthFailed)?;
            let mac_matches = header_str(headers, "x-runner-mac").is_some_and(|mac| constant_time_matches(mac, &runner.mac));
            let machine_id_matches = header_str(headers, "x-runner-machine-id").is_some_and(|id| constant_time_matches(id, &runner.machine_id));
            if mac_matches || machine_id_matches {
                state.audit.record(AuthAuditEvent::allow(challengectl_core::PrincipalClass::Runner, "bearer token and host identifier matched", peer_addr, fingerprint));
                return Ok(Principal::Runner(runner_id));
            }
            state.audit.record(AuthAuditEvent::deny(challengectl_core::PrincipalClass::Rejected, "runner key matched but no host identifier matched", peer_addr, fingerprint));
            return Err(ApiError::AuthFailed);
        }

        if verify_bcrypt(&token, &state.provisioning_key_hash).await {
            state.audit.record(AuthAuditEvent::allow(challengectl_core::PrincipalClass::Provisioning, "provisioning key matched", peer_addr, fingerprint));
            return Ok(Principal::Provisioning);
        }

        // Rule 3: a bearer token that is not a runner or provisioning match is
        // tentatively classified as an enrollment credential. Its actual
        // validity (unused, unexpired) is checked atomically by the
        // enrollment handler itself, which is the only handler that accepts
        // this principal class.
        state.audit.record(AuthAuditEvent::allow(challengectl_core::PrincipalClass::Enrollment, "bearer token deferred to enrollment consumption", peer_addr, fingerprint));
        return Ok(Principal::Enrollment(EnrollmentToken::new(token)));
    }

    if let Some(session) = session_token(headers) {
        if let Some(user) = state.dispatch.validate_admin_session(&session).await.unwrap_or(None) {
            state.audit.record(AuthAuditEvent::allow(challengectl_core::PrincipalClass::Admin, "session cookie verified", peer_addr, None));
            return Ok(Principal::Admin(user));
        }
        state.audit.record(AuthAuditEvent::deny(challengectl_core::PrincipalClass::Rejected, "session cookie invalid or expired", peer_addr, None));
        return Err(ApiError::AuthFailed);
    }

    state.audit.record(AuthAuditEvent::allow(challengectl_core::PrincipalClass::Anonymous, "no credentials presented", peer_addr, None));
    Ok(Principal::Anonymous)
}

async fn verify_bcrypt(candidate: &str, hash: &str) -> bool {
    let candidate = candidate.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash).unwrap_or(false)).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions")]
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn session_token_parses_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, HeaderValue::from_static("other=1; challengectl_session=sess-xyz; third=2"));
        assert_eq!(session_token(&headers).as_deref(), Some("sess-xyz"));
    }

    #[test]
    fn constant_time_matches_rejects_different_lengths() {
        assert!(!constant_time_matches("abc", "abcd"));
        assert!(constant_time_matches("abc", "abc"));
    }

    #[tokio::test]
    async fn verify_bcrypt_false_for_garbage_hash() {
        assert!(!verify_bcrypt("anything", "not-a-bcrypt-hash").await);
    }
}
