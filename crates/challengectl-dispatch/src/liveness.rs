// crates/challengectl-dispatch/src/liveness.rs
// ============================================================================
// Module: Liveness Monitor
// Description: The three independent periodic sweeps that recover state
//              without operator intervention.
// Purpose: Run stale-runner, stale-assignment, and expired-token sweeps on
//          their own cadences, each skipping an overrunning tick rather than
//          queuing behind it.
// Dependencies: tokio
// ============================================================================

//! ## Overview
//! Each sweep is spawned as its own `tokio` task driven by a
//! [`tokio::time::interval`] with [`tokio::time::MissedTickBehavior::Skip`].
//! A tick that finds the previous tick's body still running is dropped
//! rather than left to pile up — the guarantee wanted here is "at
//! most one sweep of a given kind in flight", not "exactly one every
//! interval".

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::core::DispatchCore;

// ============================================================================
// SECTION: Tunables
// ============================================================================

/// Cadences and thresholds for the three background sweeps.
#[derive(Debug, Clone, Copy)]
pub struct LivenessTunables {
    /// A runner with no heartbeat for this long is marked offline.
    pub heartbeat_timeout_ms: i64,
    /// How often the stale-runner and stale-assignment sweeps run.
    pub stale_sweep_interval: Duration,
    /// How often the expired-token sweep runs.
    pub expired_token_sweep_interval: Duration,
}

impl Default for LivenessTunables {
    fn default() -> Self {
        Self { heartbeat_timeout_ms: 90_000, stale_sweep_interval: Duration::from_secs(30), expired_token_sweep_interval: Duration::from_secs(60) }
    }
}

// ============================================================================
// SECTION: Liveness Monitor
// ============================================================================

/// Owns the three background sweep tasks as an explicit start/stop/join
/// lifecycle rather than detached fire-and-forget spawns.
pub struct LivenessMonitor {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Spawns all three sweeps against `core` using `tunables`.
    #[must_use]
    pub fn spawn(core: Arc<DispatchCore>, tunables: LivenessTunables) -> Self {
        let (shutdown, _) = watch::channel(false);

        let stale_runners_handle = {
            let core = Arc::clone(&core);
            let rx = shutdown.subscribe();
            let interval = tunables.stale_sweep_interval;
            spawn_guarded_sweep(rx, interval, move || {
                let core = Arc::clone(&core);
                async move {
                    let _ = core.sweep_stale_runners(tunables.heartbeat_timeout_ms).await;
                }
            })
        };

        let stale_assignments_handle = {
            let core = Arc::clone(&core);
            let rx = shutdown.subscribe();
            let interval = tunables.stale_sweep_interval;
            spawn_guarded_sweep(rx, interval, move || {
                let core = Arc::clone(&core);
                async move {
                    let _ = core.sweep_stale_assignments().await;
                }
            })
        };

        let expired_tokens_handle = {
            let rx = shutdown.subscribe();
            let interval = tunables.expired_token_sweep_interval;
            spawn_guarded_sweep(rx, interval, move || {
                let core = Arc::clone(&core);
                async move {
                    let _ = core.sweep_expired_tokens().await;
                }
            })
        };

        Self { shutdown, handles: vec![stale_runners_handle, stale_assignments_handle, expired_tokens_handle] }
    }

    /// Signals every sweep to stop and waits for them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// SECTION: Sweep Driver
// ============================================================================

/// Drives `body` on `period`, skipping any tick that arrives while the
/// previous invocation of `body` is still running, and exiting as soon as
/// `shutdown` observes `true`.
fn spawn_guarded_sweep<F, Fut>(mut shutdown: watch::Receiver<bool>, period: Duration, body: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let running = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if running.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    let running = Arc::clone(&running);
                    let fut = body();
                    tokio::spawn(async move {
                        fut.await;
                        running.store(false, Ordering::Release);
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test assertions")]
    use std::sync::Arc;

    use challengectl_core::ChallengeConfigUpsert;
    use challengectl_events::EventBus;
    use challengectl_store_sqlite::SqliteDurableStore;

    use super::*;
    use crate::core::DispatchCore;

    #[tokio::test]
    async fn monitor_starts_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDurableStore::open(dir.path().join("t.sqlite3"), 1).await.unwrap();
        let events = EventBus::new();
        let core = Arc::new(DispatchCore::new(Arc::new(store), Arc::new(events)));

        let tunables = LivenessTunables { heartbeat_timeout_ms: 1, stale_sweep_interval: Duration::from_millis(10), expired_token_sweep_interval: Duration::from_millis(10) };
        let monitor = LivenessMonitor::spawn(Arc::clone(&core), tunables);

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_reloads_and_assigns_do_not_panic_under_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDurableStore::open(dir.path().join("t2.sqlite3"), 50).await.unwrap();
        let events = EventBus::new();
        let core = Arc::new(DispatchCore::new(Arc::new(store), Arc::new(events)));
        core.reload(vec![ChallengeConfigUpsert {
            name: "sweep-test".to_owned(),
            config: challengectl_core::ChallengeConfig {
                modulation: "cw".to_owned(),
                frequency_spec: challengectl_core::FrequencySpec::SingleHz { hz: 146_520_000 },
                files: vec![],
                delay_min_ms: 10,
                delay_max_ms: 10,
                priority: 1,
                enabled: true,
                public_view: false,
            },
        }])
        .await
        .unwrap();

        let tunables = LivenessTunables { heartbeat_timeout_ms: 10, stale_sweep_interval: Duration::from_millis(10), expired_token_sweep_interval: Duration::from_millis(20) };
        let monitor = LivenessMonitor::spawn(Arc::clone(&core), tunables);
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.shutdown().await;
    }
}
