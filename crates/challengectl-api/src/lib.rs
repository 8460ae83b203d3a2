// crates/challengectl-api/src/lib.rs
// ============================================================================
// Crate: challengectl-api
// Description: The Control Plane API (spec.md §4.6, §6, C6): the HTTP
//              request surface runners and operators call.
// Purpose: Resolve a principal (C3) then call exactly one Dispatch Core or
//          Blob Store operation per request; no business logic lives here.
// Dependencies: axum, challengectl-core, challengectl-dispatch,
//               challengectl-events
// ============================================================================

//! # challengectl-api
//!
//! Four pieces:
//! - [`auth`]: the Principal Resolver (C3), spec.md §4.3.
//! - [`state`]: [`AppState`], the shared handle every handler receives.
//! - [`handlers`]: one thin handler per spec.md §6 endpoint, plus
//!   [`build_router`].
//! - [`ws`]: the `/events` WebSocket fan-out endpoint (C7).
//!
//! This crate has no dependency on `challengectl-store-sqlite` in its main
//! build; it only knows the `challengectl-core` trait objects `DispatchCore`
//! and `BlobStore` are built from. Concrete store wiring is the binary
//! crate's job.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod state;
pub mod ws;

pub use crate::error::ApiError;
pub use crate::handlers::build_router;
pub use crate::state::AppState;
