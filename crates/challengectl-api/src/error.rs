// crates/challengectl-api/src/error.rs
// ============================================================================
// Module: API Error
// Description: The final error taxonomy as HTTP responses.
// Purpose: Give every handler one `?`-friendly error type that maps to the
//          correct status code and a structured JSON body.
// Dependencies: axum, challengectl-core, challengectl-dispatch, serde_json
// ============================================================================

//! ## Overview
//! Every lower-layer error (`StoreError`, `BlobStoreError`, `DispatchError`,
//! `ConfigError`) folds into this one enum via `From`: each crate owns its
//! error type, and lower errors wrap into higher ones via `From`.
//! `fatal-storage-corruption` is intentionally NOT mapped to a normal
//! response here — see [`ApiError::is_fatal`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use challengectl_core::BlobStoreError;
use challengectl_core::StoreError;
use challengectl_dispatch::DispatchError;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: ApiError
// ============================================================================

/// The error taxonomy returned to HTTP callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials were absent, malformed, or did not match any rule.
    #[error("authentication failed")]
    AuthFailed,
    /// The principal is valid but lacks authority for this operation.
    #[error("forbidden")]
    Forbidden,
    /// The caller's assignment had already been cleared or reassigned.
    #[error("stale assignment")]
    StaleAssignment,
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
    /// A conditional write lost a race.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The write lock could not be acquired within the configured deadline.
    #[error("capacity exceeded")]
    Capacity,
    /// A transient I/O failure that exhausted its retry budget.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),
    /// The request body failed validation before reaching any store call.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Stored content failed an integrity check. Never sent to the caller as
    /// a normal response; see [`ApiError::is_fatal`].
    #[error("fatal storage corruption: {0}")]
    FatalCorruption(String),
}

impl ApiError {
    /// Whether this error represents the §7 `fatal-storage-corruption` kind,
    /// which the controller binary's top-level loop treats as a process-level
    /// abort rather than a normal response.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalCorruption(_))
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth-failed",
            Self::Forbidden => "forbidden",
            Self::StaleAssignment => "stale-assignment",
            Self::NotFound => "not-found",
            Self::Conflict(_) => "conflict",
            Self::Capacity => "capacity",
            Self::TransientIo(_) => "transient-io",
            Self::BadRequest(_) => "bad-request",
            Self::FatalCorruption(_) => "fatal-storage-corruption",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::StaleAssignment | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Capacity | Self::TransientIo(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::FatalCorruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: self.kind(), message: self.to_string() };
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            StoreError::Conflict(reason) => Self::Conflict(reason),
            StoreError::VersionMismatch => Self::FatalCorruption("schema version mismatch".to_owned()),
            StoreError::Capacity => Self::Capacity,
            StoreError::TransientIo(reason) => Self::TransientIo(reason),
            StoreError::FatalCorruption(reason) => Self::FatalCorruption(reason),
        }
    }
}

impl From<BlobStoreError> for ApiError {
    fn from(err: BlobStoreError) -> Self {
        match err {
            BlobStoreError::NotFound => Self::NotFound,
            BlobStoreError::DigestMismatch(digest) => Self::FatalCorruption(format!("content digest mismatch for {digest}")),
            BlobStoreError::Io(reason) => Self::TransientIo(reason),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Store(store_err) => store_err.into(),
            DispatchError::Hashing(reason) => Self::TransientIo(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions")]
    use super::*;

    #[test]
    fn store_not_found_maps_to_404_kind() {
        let err: ApiError = StoreError::NotFound.into();
        assert_eq!(err.kind(), "not-found");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn store_capacity_maps_to_503() {
        let err: ApiError = StoreError::Capacity.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn fatal_corruption_is_flagged() {
        let err = ApiError::FatalCorruption("digest mismatch".to_owned());
        assert!(err.is_fatal());
        assert!(!ApiError::NotFound.is_fatal());
    }
}
