//! Worker (activity) dispatcher implementation for Runtime
//!
//! Activities run outside any instance lease. Each execution is peek-locked on the worker
//! queue and acknowledged together with its completion, so a crash between the two leads
//! to another attempt rather than a lost result.

use crate::providers::{QueueKind, WorkItem};
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails, Event};
use ::futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::Runtime;
use super::{Renewal, spawn_lock_renewal_task};

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.worker_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();
        let mut worker_handles = Vec::with_capacity(concurrency);

        for worker_idx in 0..concurrency {
            let rt = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
            let handle = tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    match rt
                        .history_store
                        .dequeue_work(QueueKind::Worker, rt.options.worker_lock_timeout)
                        .await
                    {
                        Ok(Some((item, token))) => rt.execute_work_item(item, token, &worker_id).await,
                        Ok(None) => tokio::time::sleep(rt.options.dispatcher_idle_sleep).await,
                        Err(e) => {
                            warn!(
                                target: "dureplay::runtime",
                                worker_id = %worker_id,
                                error = %e,
                                "error dequeuing activity work"
                            );
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            });
            worker_handles.push(handle);
        }
        worker_handles
    }

    async fn execute_work_item(&self, item: WorkItem, token: String, worker_id: &str) {
        let (instance, seq, attempt, name, input) = match item {
            WorkItem::ActivityExecute {
                instance,
                seq,
                attempt,
                name,
                input,
            } => (instance, seq, attempt, name, input),
            other => {
                error!(
                    target: "dureplay::runtime",
                    worker_id = %worker_id,
                    kind = other.kind_name(),
                    "unexpected work item on worker queue, discarding"
                );
                self.discard(&token, worker_id).await;
                return;
            }
        };

        // Work for a finished instance would only be discarded by the coordinator.
        if let Ok(Some(loaded)) = self.history_store.load(&instance).await
            && loaded.history.iter().any(Event::is_terminal)
        {
            debug!(
                target: "dureplay::runtime",
                instance_id = %instance,
                seq,
                attempt,
                activity_name = %name,
                "skipping activity for terminal instance"
            );
            self.discard(&token, worker_id).await;
            return;
        }

        let renewal_handle = spawn_lock_renewal_task(
            self.history_store.clone(),
            Renewal::Work(QueueKind::Worker, token.clone()),
            self.options.worker_lock_timeout,
            self.options.lease_renewal_buffer,
            self.shutdown_flag.clone(),
        );

        debug!(
            target: "dureplay::runtime",
            instance_id = %instance,
            seq,
            attempt,
            activity_name = %name,
            worker_id = %worker_id,
            "activity started"
        );
        let start_time = std::time::Instant::now();

        let outcome: Result<String, ErrorDetails> = match self.activity_registry.resolve_handler(&name) {
            Some((_, handler)) => {
                let ctx = ActivityContext::new(instance.clone(), seq, attempt, name.clone());
                match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(message)) => Err(ErrorDetails::activity_failed(message)),
                    Err(panic) => Err(ErrorDetails::Application {
                        kind: AppErrorKind::Panicked,
                        message: panic_message(panic),
                    }),
                }
            }
            None => Err(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: name.clone(),
                message: None,
            }),
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let completion = match &outcome {
            Ok(result) => {
                debug!(
                    target: "dureplay::runtime",
                    instance_id = %instance,
                    seq,
                    attempt,
                    activity_name = %name,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    result_size = result.len(),
                    "activity completed"
                );
                WorkItem::ActivityCompleted {
                    instance: instance.clone(),
                    seq,
                    attempt,
                    result: result.clone(),
                }
            }
            Err(details) => {
                warn!(
                    target: "dureplay::runtime",
                    instance_id = %instance,
                    seq,
                    attempt,
                    activity_name = %name,
                    worker_id = %worker_id,
                    outcome = details.category(),
                    duration_ms,
                    error = %details,
                    "activity failed"
                );
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    seq,
                    attempt,
                    details: details.clone(),
                }
            }
        };

        let ack = self
            .history_store
            .ack_work(QueueKind::Worker, &token, Some(completion))
            .await;
        renewal_handle.abort();

        match ack {
            Ok(()) => match &outcome {
                Ok(_) => self.metrics.record_activity_success(),
                Err(details) => self.metrics.record_activity_failure(details),
            },
            Err(e) => {
                // The lock was lost; the item is redelivered and the activity runs again.
                warn!(
                    target: "dureplay::runtime",
                    instance_id = %instance,
                    seq,
                    attempt,
                    worker_id = %worker_id,
                    error = %e,
                    "activity ack failed"
                );
            }
        }
    }

    /// Acknowledge an item without a completion.
    async fn discard(&self, token: &str, worker_id: &str) {
        if let Err(e) = self.history_store.ack_work(QueueKind::Worker, token, None).await {
            warn!(
                target: "dureplay::runtime",
                worker_id = %worker_id,
                lock_token = %token,
                error = %e,
                "failed to ack discarded work item"
            );
        }
    }
}
