// crates/challengectl-runner/src/lib.rs
// ============================================================================
// Crate: challengectl-runner
// Description: The runner agent (spec.md §4.8, C8): the process that runs on
//              every RF transmission host, polling the controller for work
//              and driving an opaque transmit callable.
// Purpose: Turn a `RunnerConfig` into a long-lived loop that enrolls,
//          registers, heartbeats, polls, syncs files, transmits, and reports
//          — entirely through `challengectl-api`'s HTTP contract, never by
//          touching the controller's storage directly.
// ============================================================================

//! # challengectl-runner
//!
//! The runner agent half of ChallengeCtl. Everything here speaks to the
//! controller only over the HTTP contract defined by `challengectl-api`; this
//! crate has no dependency on `challengectl-dispatch` or any store crate.
//!
//! The five pieces are:
//! - [`client::ControllerClient`]: a thin, retrying HTTP wrapper over the
//!   control plane API.
//! - [`cache::FileCache`]: content-addressed local storage for files a
//!   challenge's config references.
//! - [`subprocess`]: invocation of the opaque transmit and spectrum-paint
//!   callables, isolated from the async runtime.
//! - [`log`]: a sink trait for runner-local diagnostics, following the same
//!   pattern as `challengectl-core`'s `AuthAuditSink`.
//! - [`agent::RunnerAgent`]: the loop tying the above together.

pub mod agent;
pub mod cache;
pub mod client;
pub mod error;
pub mod log;
pub mod subprocess;

pub use crate::agent::RunnerAgent;
pub use crate::cache::FileCache;
pub use crate::client::ControllerClient;
pub use crate::error::RunnerError;
pub use crate::log::NoopRunnerLog;
pub use crate::log::RunnerLog;
pub use crate::log::StderrRunnerLog;
