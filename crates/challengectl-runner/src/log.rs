// crates/challengectl-runner/src/log.rs
// ============================================================================
// Module: Runner Log Sink
// Description: A minimal fan-in point for runner-local diagnostics (retry
//              backoff, heartbeat failures, transmit outcomes).
// Purpose: Give the agent loop one place to report what it is doing without
//          pulling in a tracing/log dependency the teacher's stack does not
//          carry; mirrors `challengectl-core`'s `AuthAuditSink` sink-trait
//          shape.
// Dependencies: std::io
// ============================================================================

//! ## Overview
//! `RunnerLog` is deliberately narrow: one method per kind of event the agent
//! loop needs to surface, not a generic `log(level, message)` call. This
//! keeps call sites self-describing and keeps the trait easy to implement
//! for tests (a `Vec`-backed collector) without formatting strings twice.

use std::io::stderr;
use std::io::Write as _;

use challengectl_core::ChallengeId;
use challengectl_core::RunnerId;

/// Sink for runner agent lifecycle and error events.
///
/// Implementations must not block the caller for any significant duration;
/// the agent loop calls these synchronously from its hot path.
pub trait RunnerLog: Send + Sync {
    /// The agent registered (or re-registered) with the controller.
    fn registered(&self, runner_id: &RunnerId);
    /// A heartbeat attempt failed; `attempt` is the 1-based retry count.
    fn heartbeat_failed(&self, attempt: u32, reason: &str);
    /// A poll, file sync, or report attempt was retried after a transient error.
    fn retrying(&self, operation: &str, attempt: u32, reason: &str);
    /// The controller reported that an assignment was stale.
    fn stale_assignment(&self, challenge_id: &ChallengeId);
    /// A transmission attempt finished, successfully or not.
    fn transmission_finished(&self, challenge_id: &ChallengeId, success: bool, detail: &str);
    /// A fatal, non-retryable error forced the agent to stop.
    fn fatal(&self, reason: &str);
}

/// A [`RunnerLog`] that discards every event. Used in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRunnerLog;

impl RunnerLog for NoopRunnerLog {
    fn registered(&self, _runner_id: &RunnerId) {}
    fn heartbeat_failed(&self, _attempt: u32, _reason: &str) {}
    fn retrying(&self, _operation: &str, _attempt: u32, _reason: &str) {}
    fn stale_assignment(&self, _challenge_id: &ChallengeId) {}
    fn transmission_finished(&self, _challenge_id: &ChallengeId, _success: bool, _detail: &str) {}
    fn fatal(&self, _reason: &str) {}
}

/// A [`RunnerLog`] that writes one line per event to stderr.
///
/// Uses `std::io::stderr()` directly rather than `eprintln!`, since the
/// workspace denies `clippy::print_stderr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrRunnerLog;

impl StderrRunnerLog {
    fn write_line(&self, message: &str) {
        let mut handle = stderr();
        let _ = writeln!(handle, "{message}");
    }
}

impl RunnerLog for StderrRunnerLog {
    fn registered(&self, runner_id: &RunnerId) {
        self.write_line(&format!("registered as {runner_id}"));
    }

    fn heartbeat_failed(&self, attempt: u32, reason: &str) {
        self.write_line(&format!("heartbeat attempt {attempt} failed: {reason}"));
    }

    fn retrying(&self, operation: &str, attempt: u32, reason: &str) {
        self.write_line(&format!("{operation} attempt {attempt} failed, retrying: {reason}"));
    }

    fn stale_assignment(&self, challenge_id: &ChallengeId) {
        self.write_line(&format!("assignment for {challenge_id} was stale"));
    }

    fn transmission_finished(&self, challenge_id: &ChallengeId, success: bool, detail: &str) {
        let outcome = if success { "succeeded" } else { "failed" };
        self.write_line(&format!("transmission for {challenge_id} {outcome}: {detail}"));
    }

    fn fatal(&self, reason: &str) {
        self.write_line(&format!("fatal: {reason}"));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions")]
    use super::*;

    #[test]
    fn noop_log_accepts_any_event() {
        let log = NoopRunnerLog;
        log.registered(&RunnerId::new("r1"));
        log.fatal("unreachable");
    }

    #[test]
    fn stderr_log_does_not_panic() {
        let log = StderrRunnerLog;
        log.retrying("poll_task", 2, "connection reset");
        log.transmission_finished(&ChallengeId::new("c1"), true, "ok");
    }
}
