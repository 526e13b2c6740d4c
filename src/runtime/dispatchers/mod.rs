//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: coordinator workers that fold work items and run activations
//! - `worker`: activity workers
//! - `timer`: feeds the timer queue into the in-process [`TimerService`](super::timers::TimerService)

mod orchestration;
mod timer;
mod worker;

use crate::providers::{HistoryStore, QueueKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Calculate the renewal interval based on lock timeout and buffer settings.
///
/// - If timeout ≥ 15s: renew at (timeout - buffer)
/// - If timeout < 15s: renew at 0.5 × timeout (buffer ignored)
fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        let buffer = buffer.min(lock_timeout);
        let interval = lock_timeout
            .checked_sub(buffer)
            .unwrap_or_else(|| Duration::from_secs(1));
        interval.max(Duration::from_secs(1))
    } else {
        let half_ms = (lock_timeout.as_millis() as u64 / 2).max(1);
        Duration::from_millis(half_ms)
    }
}

/// What a renewal task keeps alive.
#[derive(Debug, Clone)]
enum Renewal {
    /// Instance lease taken by `fetch_orchestration_batch`
    Orchestration(String),
    /// Peek-lock on a worker or timer item
    Work(QueueKind, String),
}

impl Renewal {
    fn token(&self) -> &str {
        match self {
            Renewal::Orchestration(t) | Renewal::Work(_, t) => t,
        }
    }
}

/// Spawn a background task that renews a lease or lock until it is aborted, the
/// runtime shuts down, or renewal fails.
fn spawn_lock_renewal_task(
    store: Arc<dyn HistoryStore>,
    renewal: Renewal,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tracing::debug!(
        target: "dureplay::runtime::dispatchers",
        lock_token = %renewal.token(),
        lock_timeout_ms = lock_timeout.as_millis() as u64,
        renewal_interval_ms = renewal_interval.as_millis() as u64,
        "spawning lock renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let renewed = match &renewal {
                Renewal::Orchestration(token) => store.renew_orchestration_lease(token, lock_timeout).await,
                Renewal::Work(kind, token) => store.renew_work_lock(*kind, token, lock_timeout).await,
            };
            match renewed {
                Ok(()) => {
                    tracing::trace!(
                        target: "dureplay::runtime::dispatchers",
                        lock_token = %renewal.token(),
                        "lock renewed"
                    );
                }
                Err(e) => {
                    // Already acked or abandoned, or expired; nothing left to keep alive.
                    tracing::debug!(
                        target: "dureplay::runtime::dispatchers",
                        lock_token = %renewal.token(),
                        error = %e,
                        "lock renewal failed, stopping"
                    );
                    break;
                }
            }
        }
    })
}
