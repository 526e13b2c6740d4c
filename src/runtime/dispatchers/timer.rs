//! Timer intake: moves peek-locked `TimerSchedule` items into the in-process timer service.

use crate::providers::QueueKind;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::super::Runtime;
use super::super::timers::{LockedTimer, TimerService};

impl Runtime {
    /// Start the timer service and the loop that feeds it from the timer queue.
    ///
    /// Held timers stay locked in the store. A timer that outlives its lock is delivered
    /// again and the service keeps the newer token.
    pub(in crate::runtime) fn start_timer_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let idle_ms = self.options.dispatcher_idle_sleep.as_millis().max(1) as u64;
        let (service_handle, tx) = TimerService::start(self.history_store.clone(), idle_ms);
        let shutdown = self.shutdown_flag.clone();

        let intake = tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match self
                    .history_store
                    .dequeue_work(QueueKind::Timer, self.options.worker_lock_timeout)
                    .await
                {
                    Ok(Some((item, lock_token))) => {
                        if tx.send(LockedTimer { item, lock_token }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => tokio::time::sleep(self.options.dispatcher_idle_sleep).await,
                    Err(e) => {
                        warn!(target: "dureplay::runtime", error = %e, "error dequeuing timer work");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        vec![service_handle, intake]
    }
}
