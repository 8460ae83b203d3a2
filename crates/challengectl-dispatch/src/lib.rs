// crates/challengectl-dispatch/src/lib.rs
// ============================================================================
// Crate: challengectl-dispatch
// Description: The Dispatch Core (C4) and Liveness Monitor (C5): the
//              transactional heart of ChallengeCtl's mutual-exclusion
//              guarantee, plus the background sweeps that recover from
//              runner loss without operator intervention.
// Purpose: Give `challengectl-api` one call-site per dispatch operation,
//          with event emission wired in after every commit.
// Dependencies: challengectl-core, bcrypt, rand, tokio
// ============================================================================

//! ## Overview
//! [`DispatchCore`] is a thin orchestration layer over
//! [`challengectl_core::DurableStore`]: every method calls exactly one store
//! operation and, only after it returns successfully, publishes the
//! corresponding [`challengectl_core::Event`] — a strict publish-after-commit
//! rule, so the store never needs to know about the event bus at all.
//!
//! [`liveness::LivenessMonitor`] owns the three periodic sweeps as
//! independent, explicitly start/stop/join-able background tasks, each
//! guarded so an overrunning tick is skipped rather than overlapped.

mod core;
mod liveness;

pub use crate::core::generate_api_key;
pub use crate::core::DispatchCore;
pub use crate::core::DispatchError;
pub use crate::liveness::LivenessMonitor;
pub use crate::liveness::LivenessTunables;
