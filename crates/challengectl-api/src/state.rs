// crates/challengectl-api/src/state.rs
// ============================================================================
// Module: API Application State
// Description: The shared handle every axum handler receives, holding
//              every dependency explicitly rather than through globals.
// Purpose: Bundle the dispatch core, blob store, event bus, and auth audit
//          sink behind one `Clone`-able struct suitable for `axum::State`.
// Dependencies: axum, challengectl-core, challengectl-dispatch,
//               challengectl-events, tokio
// ============================================================================

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use challengectl_core::AuthAuditSink;
use challengectl_core::BlobStore;
use challengectl_core::NoopAuditSink;
use challengectl_dispatch::DispatchCore;
use challengectl_events::EventBus;
use tokio::sync::Semaphore;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum number of write-path handlers allowed in flight at once before
/// new requests are rejected with `capacity`.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 64;

// ============================================================================
// SECTION: AppState
// ============================================================================

/// Shared state handed to every axum handler via [`axum::extract::State`].
#[derive(Clone)]
pub struct AppState {
    /// Orchestrates store operations and event publication.
    pub dispatch: Arc<DispatchCore>,
    /// Content-addressed binary storage.
    pub blobs: Arc<dyn BlobStore>,
    /// Concrete event bus, held separately from the `EventLog` trait object
    /// inside `dispatch` so the `/events` WebSocket handler can subscribe.
    pub events: Arc<EventBus>,
    /// Records every principal-resolution outcome, success or failure.
    pub audit: Arc<dyn AuthAuditSink>,
    /// Bcrypt hash of the provisioning key.
    pub provisioning_key_hash: Arc<str>,
    /// Bounds concurrent write-path handlers.
    pub write_permits: Arc<Semaphore>,
}

impl AppState {
    /// Builds application state with the default write concurrency bound and
    /// a no-op audit sink. Most callers should prefer [`AppState::new`] and
    /// supply a real [`AuthAuditSink`]; this constructor exists for binaries
    /// and tests that have not wired one up yet.
    #[must_use]
    pub fn new(dispatch: Arc<DispatchCore>, blobs: Arc<dyn BlobStore>, events: Arc<EventBus>, provisioning_key_hash: impl Into<Arc<str>>) -> Self {
        Self { dispatch, blobs, events, audit: Arc::new(NoopAuditSink), provisioning_key_hash: provisioning_key_hash.into(), write_permits: Arc::new(Semaphore::new(DEFAULT_WRITE_CONCURRENCY)) }
    }

    /// Replaces the audit sink, returning `self` for chained construction.
    #[must_use]
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuthAuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the write concurrency bound, returning `self` for chained
    /// construction.
    #[must_use]
    pub fn with_write_concurrency(mut self, permits: usize) -> Self {
        self.write_permits = Arc::new(Semaphore::new(permits));
        self
    }
}
