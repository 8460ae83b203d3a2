// crates/challengectl-runner/src/error.rs
// ============================================================================
// Module: Runner Error
// Description: The error taxonomy for the runner agent's HTTP client, file
//              cache, and subprocess invocation.
// Purpose: Give every runner-side fallible operation one `?`-friendly error
//          type, with the same §7 kind names `challengectl-api` uses so an
//          operator reading logs from both sides recognizes the same words.
// Dependencies: challengectl-config, reqwest, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `RunnerError` does not wrap `challengectl-api`'s `ApiError` directly (the
//! runner never depends on the API crate); instead [`RunnerError::from_response`]
//! re-derives the same §7 kind from the JSON error body the controller sends,
//! keeping the runner's dependency graph limited to the wire contract rather
//! than the controller's implementation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use challengectl_core::FileDigest;
use thiserror::Error;

// ============================================================================
// SECTION: RunnerError
// ============================================================================

/// Failure modes raised by the runner agent.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The underlying HTTP request could not be completed at all (DNS,
    /// connect, TLS, timeout).
    #[error("controller request failed: {0}")]
    Transport(String),
    /// Credentials were rejected outright; not retried.
    #[error("authentication failed")]
    AuthFailed,
    /// The principal is valid but lacks authority for this operation.
    #[error("forbidden")]
    Forbidden,
    /// The held assignment was no longer valid when reported complete.
    #[error("stale assignment")]
    StaleAssignment,
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// A conditional write on the controller lost a race.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The controller's write lock could not be acquired in time; retryable.
    #[error("controller at capacity")]
    Capacity,
    /// A transient failure on the controller side; retryable.
    #[error("transient controller failure: {0}")]
    TransientIo(String),
    /// The request was rejected as malformed before reaching the store.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// The controller reported unrecoverable storage corruption.
    #[error("fatal controller corruption: {0}")]
    FatalCorruption(String),
    /// A downloaded file's content did not hash to the digest that named it.
    #[error("file content digest mismatch for {0}")]
    DigestMismatch(FileDigest),
    /// Local cache or working-directory I/O failed.
    #[error("local I/O failure: {0}")]
    Io(String),
    /// The transmit or spectrum-paint callable exited non-zero or could not
    /// be spawned.
    #[error("subprocess failure: {0}")]
    Subprocess(String),
    /// The runner's configuration file failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),
    /// A response body could not be decoded as the expected JSON shape.
    #[error("malformed controller response: {0}")]
    Decode(String),
}

impl RunnerError {
    /// Whether this error represents a condition worth retrying with
    /// backoff, as opposed to one that should propagate immediately.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Capacity | Self::TransientIo(_))
    }

    /// Whether this error should abort the agent loop entirely rather than
    /// simply skip the current cycle.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed | Self::FatalCorruption(_))
    }

    /// Builds a [`RunnerError`] from an HTTP status code and the JSON error
    /// body `challengectl-api`'s `ApiError::into_response` produces
    /// (`{"error": kind, "message": ...}`), falling back to a generic
    /// transport error if the body does not parse.
    #[must_use]
    pub fn from_response(status: reqwest::StatusCode, body: &str) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
        let message = parsed.as_ref().map_or_else(|| body.to_owned(), |body| body.message.clone());
        match parsed.as_ref().map(|body| body.error.as_str()) {
            Some("auth-failed") => Self::AuthFailed,
            Some("forbidden") => Self::Forbidden,
            Some("stale-assignment") => Self::StaleAssignment,
            Some("not-found") => Self::NotFound,
            Some("conflict") => Self::Conflict(message),
            Some("capacity") => Self::Capacity,
            Some("transient-io") => Self::TransientIo(message),
            Some("bad-request") => Self::BadRequest(message),
            Some("fatal-storage-corruption") => Self::FatalCorruption(message),
            _ => Self::from_status(status, message),
        }
    }

    fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status {
            reqwest::StatusCode::UNAUTHORIZED => Self::AuthFailed,
            reqwest::StatusCode::FORBIDDEN => Self::Forbidden,
            reqwest::StatusCode::CONFLICT => Self::Conflict(message),
            reqwest::StatusCode::NOT_FOUND => Self::NotFound,
            reqwest::StatusCode::SERVICE_UNAVAILABLE => Self::Capacity,
            reqwest::StatusCode::BAD_REQUEST => Self::BadRequest(message),
            _ => Self::TransientIo(message),
        }
    }
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<challengectl_config::ConfigError> for RunnerError {
    fn from(err: challengectl_config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

#[derive(Debug, serde::Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_response_maps_known_kind() {
        let body = r#"{"error": "stale-assignment", "message": "stale assignment"}"#;
        let err = RunnerError::from_response(reqwest::StatusCode::CONFLICT, body);
        assert!(matches!(err, RunnerError::StaleAssignment));
    }

    #[test]
    fn from_response_falls_back_to_status_on_unparseable_body() {
        let err = RunnerError::from_response(reqwest::StatusCode::SERVICE_UNAVAILABLE, "not json");
        assert!(matches!(err, RunnerError::Capacity));
    }

    #[test]
    fn retryable_kinds_are_transient_or_capacity() {
        assert!(RunnerError::Capacity.is_retryable());
        assert!(RunnerError::TransientIo("disk full".to_owned()).is_retryable());
        assert!(!RunnerError::NotFound.is_retryable());
    }

    #[test]
    fn fatal_kinds_stop_the_agent() {
        assert!(RunnerError::AuthFailed.is_fatal());
        assert!(!RunnerError::StaleAssignment.is_fatal());
    }
}
