//! Orchestration dispatcher: the coordinator loop.
//!
//! Each worker leases one instance at a time, folds the leased messages into a fresh
//! load of its history, runs one activation and commits the delta together with the
//! resulting dispatch work in a single `append_if_version`.

use crate::providers::{LoadedHistory, OrchestrationBatch, ProviderError, QueueKind, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::{Action, ConfigErrorKind, ErrorDetails, Event};
use semver::Version;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::super::Runtime;
use super::{Renewal, spawn_lock_renewal_task};

/// Version recorded when no handler could be resolved.
const UNRESOLVED_VERSION: &str = "0.0.0";

/// In-place retries of an activation after a retryable store error.
const MAX_TRANSIENT_RETRIES: u32 = 3;

const ABANDON_BACKOFF: Duration = Duration::from_millis(50);

/// Map the dispatch actions of an activation to queue items.
pub(crate) fn outbox_for(instance: &str, actions: &[Action]) -> Vec<(QueueKind, WorkItem)> {
    actions
        .iter()
        .filter_map(|action| match action {
            Action::ScheduleActivity {
                seq,
                name,
                input,
                attempt,
            } => Some((
                QueueKind::Worker,
                WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    seq: *seq,
                    attempt: *attempt,
                    name: name.clone(),
                    input: input.clone(),
                },
            )),
            Action::CreateTimer { seq, fire_at_ms } => Some((
                QueueKind::Timer,
                WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    seq: *seq,
                    fire_at_ms: *fire_at_ms,
                },
            )),
            Action::CompleteOrchestration { .. } | Action::FailOrchestration { .. } => None,
        })
        .collect()
}

impl Runtime {
    /// Start N concurrent orchestration workers. Instance leases keep any two of them
    /// (or any two runtimes) from activating the same instance at once.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        let shutdown = self.shutdown_flag.clone();
        let mut worker_handles = Vec::with_capacity(concurrency);

        for worker_idx in 0..concurrency {
            let rt = Arc::clone(&self);
            let shutdown = Arc::clone(&shutdown);
            let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
            let handle = tokio::spawn(async move {
                loop {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }

                    match rt
                        .history_store
                        .fetch_orchestration_batch(&worker_id, rt.options.orchestrator_lease_timeout)
                        .await
                    {
                        Ok(Some(batch)) => {
                            let renewal_handle = spawn_lock_renewal_task(
                                Arc::clone(&rt.history_store),
                                Renewal::Orchestration(batch.lock_token.clone()),
                                rt.options.orchestrator_lease_timeout,
                                rt.options.lease_renewal_buffer,
                                Arc::clone(&shutdown),
                            );
                            rt.process_orchestration_batch(batch, &worker_id).await;
                            renewal_handle.abort();
                        }
                        Ok(None) => {
                            tokio::time::sleep(rt.options.dispatcher_idle_sleep).await;
                        }
                        Err(e) => {
                            warn!(
                                target: "dureplay::runtime",
                                worker_id = %worker_id,
                                error = %e,
                                "error fetching orchestration batch"
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

    /// Run the batch until it commits, retrying from a fresh load after losing an append race.
    ///
    /// Transient store errors are retried with backoff and then abandoned for redelivery.
    /// A permanent store error fails the instance instead, so a batch the store will never
    /// accept is not refetched forever.
    async fn process_orchestration_batch(self: &Arc<Self>, batch: OrchestrationBatch, worker_id: &str) {
        let instance = batch.instance.clone();
        let mut conflicts = 0u32;
        let mut transient = 0u32;

        loop {
            match self.run_activation(&batch, worker_id).await {
                Ok(()) => {
                    self.ack_batch(&batch, worker_id).await;
                    return;
                }
                Err(e) if e.is_version_conflict() && conflicts < self.options.max_append_conflict_retries => {
                    conflicts += 1;
                    self.metrics.record_version_conflict();
                    warn!(
                        target: "dureplay::runtime",
                        instance_id = %instance,
                        worker_id = %worker_id,
                        conflicts,
                        error = %e,
                        "append lost a version race, re-running activation"
                    );
                }
                Err(e) if e.is_retryable() && transient < MAX_TRANSIENT_RETRIES => {
                    transient += 1;
                    let backoff = Duration::from_millis(10u64 << transient);
                    warn!(
                        target: "dureplay::runtime",
                        instance_id = %instance,
                        worker_id = %worker_id,
                        attempts = transient,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying activation"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_version_conflict() || e.is_retryable() => {
                    if e.is_version_conflict() {
                        self.metrics.record_version_conflict();
                    }
                    error!(
                        target: "dureplay::runtime",
                        instance_id = %instance,
                        worker_id = %worker_id,
                        error = %e,
                        "activation failed, abandoning batch for redelivery"
                    );
                    self.abandon_batch(&batch).await;
                    return;
                }
                Err(e) => {
                    error!(
                        target: "dureplay::runtime",
                        instance_id = %instance,
                        worker_id = %worker_id,
                        error = %e,
                        "store rejected activation permanently, failing instance"
                    );
                    self.fail_on_store_error(&batch, worker_id, &e).await;
                    return;
                }
            }
        }
    }

    async fn ack_batch(&self, batch: &OrchestrationBatch, worker_id: &str) {
        if let Err(e) = self.history_store.ack_orchestration_batch(&batch.lock_token).await {
            warn!(
                target: "dureplay::runtime",
                instance_id = %batch.instance,
                worker_id = %worker_id,
                error = %e,
                "failed to ack orchestration batch"
            );
        }
    }

    /// Release the batch for redelivery after a short backoff. The lease stays held during
    /// the backoff, so no worker picks the instance up again immediately.
    async fn abandon_batch(&self, batch: &OrchestrationBatch) {
        tokio::time::sleep(ABANDON_BACKOFF).await;
        if let Err(e) = self.history_store.abandon_orchestration_batch(&batch.lock_token).await {
            warn!(
                target: "dureplay::runtime",
                instance_id = %batch.instance,
                error = %e,
                "failed to abandon orchestration batch"
            );
        }
    }

    /// Record an infrastructure failure for an instance whose activation the store rejected.
    async fn fail_on_store_error(&self, batch: &OrchestrationBatch, worker_id: &str, cause: &ProviderError) {
        let instance = batch.instance.as_str();
        let recorded = match self.history_store.load(instance).await {
            Ok(Some(loaded)) if !loaded.history.iter().any(Event::is_terminal) => {
                let mut engine = ReplayEngine::new(instance, loaded.history, super::super::now_ms());
                let pinned = loaded.record.version.as_deref().unwrap_or(UNRESOLVED_VERSION);
                engine.start(&loaded.record.orchestration, pinned, &loaded.record.input);
                let outcome = engine.fail(cause.to_infrastructure_error());
                self.commit(instance, loaded.version, engine, outcome, worker_id).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        match recorded {
            Ok(()) => self.ack_batch(batch, worker_id).await,
            Err(e) => {
                error!(
                    target: "dureplay::runtime",
                    instance_id = %instance,
                    worker_id = %worker_id,
                    error = %e,
                    "could not record infrastructure failure, abandoning batch"
                );
                self.abandon_batch(batch).await;
            }
        }
    }

    /// One activation against a fresh load: fold, replay, commit.
    async fn run_activation(&self, batch: &OrchestrationBatch, worker_id: &str) -> Result<(), ProviderError> {
        let instance = batch.instance.as_str();
        let Some(loaded) = self.history_store.load(instance).await? else {
            warn!(target: "dureplay::runtime", instance_id = %instance, "discarding work for unknown instance");
            return Ok(());
        };
        if loaded.history.iter().any(Event::is_terminal) {
            debug!(
                target: "dureplay::runtime",
                instance_id = %instance,
                messages = batch.messages.len(),
                "discarding work for terminal instance"
            );
            return Ok(());
        }

        self.metrics.record_activation();
        let LoadedHistory {
            record,
            history,
            version,
        } = loaded;
        let was_empty = history.is_empty();
        let mut engine = ReplayEngine::new(instance, history, super::super::now_ms());

        if let Some(reason) = batch.messages.iter().find_map(|m| match m {
            WorkItem::TerminateInstance { reason, .. } => Some(reason.clone()),
            _ => None,
        }) {
            let pinned = record.version.as_deref().unwrap_or(UNRESOLVED_VERSION);
            engine.start(&record.orchestration, pinned, &record.input);
            let outcome = engine.terminate(&reason);
            return self.commit(instance, version, engine, outcome, worker_id).await;
        }

        // Brand-new instances resolve their version now; later activations use the pinned one.
        let resolved = if was_empty {
            let resolved = match record.version.as_deref() {
                Some(v) => Version::parse(v).ok().and_then(|v| {
                    self.orchestration_registry
                        .resolve_handler_exact(&record.orchestration, &v)
                        .map(|h| (v, h))
                }),
                None => self.orchestration_registry.resolve_handler(&record.orchestration),
            };
            let version_label = resolved
                .as_ref()
                .map(|(v, _)| v.to_string())
                .or_else(|| record.version.clone())
                .unwrap_or_else(|| UNRESOLVED_VERSION.to_string());
            engine.start(&record.orchestration, &version_label, &record.input);
            resolved.map(|(_, h)| (h, record.input.clone()))
        } else {
            engine.started_with().and_then(|(name, version, input)| {
                Version::parse(&version)
                    .ok()
                    .and_then(|v| self.orchestration_registry.resolve_handler_exact(&name, &v))
                    .map(|h| (h, input))
            })
        };

        let Some((handler, input)) = resolved else {
            let outcome = engine.fail(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredOrchestration,
                resource: record.orchestration.clone(),
                message: None,
            });
            return self.commit(instance, version, engine, outcome, worker_id).await;
        };

        let activation = engine.activate(handler, input, batch.messages.clone());
        self.commit(instance, version, engine, activation.outcome, worker_id).await
    }

    async fn commit(
        &self,
        instance: &str,
        expected_version: u64,
        engine: ReplayEngine,
        outcome: TurnResult,
        worker_id: &str,
    ) -> Result<(), ProviderError> {
        if !engine.made_progress() {
            debug!(target: "dureplay::runtime", instance_id = %instance, "activation made no progress");
            return Ok(());
        }
        let outbox = outbox_for(instance, engine.pending_actions());
        let delta = engine.history_delta().to_vec();
        let appended = delta.len();
        let new_version = self
            .history_store
            .append_if_version(instance, expected_version, delta, outbox)
            .await?;

        debug!(
            target: "dureplay::runtime",
            instance_id = %instance,
            worker_id = %worker_id,
            appended,
            version = new_version,
            actions = engine.pending_actions().len(),
            "activation committed"
        );
        self.metrics.record_retries_scheduled(engine.retries_scheduled());

        match &outcome {
            TurnResult::Continue => {}
            TurnResult::Completed(_) => {
                self.metrics.record_orchestration_completion();
                info!(target: "dureplay::runtime", instance_id = %instance, worker_id = %worker_id, "orchestration completed");
            }
            TurnResult::Failed(details) => {
                self.metrics.record_orchestration_failure(details);
                warn!(
                    target: "dureplay::runtime",
                    instance_id = %instance,
                    worker_id = %worker_id,
                    category = details.category(),
                    error = %details,
                    "orchestration failed"
                );
            }
            TurnResult::Terminated(reason) => {
                self.metrics.record_orchestration_termination();
                info!(target: "dureplay::runtime", instance_id = %instance, reason = %reason, "orchestration terminated");
            }
        }
        Ok(())
    }
}
