use crate::correlator::EventCorrelator;
use crate::providers::WorkItem;
use crate::retry::{RetryDecision, RetryScheduler};
use crate::runtime::OrchestrationHandler;
use crate::{Action, AppErrorKind, ErrorDetails, Event, EventKind, INITIAL_EVENT_ID, OrchestrationContext, TimerPurpose};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// Orchestration is waiting on at least one unresolved call
    Continue,
    /// Orchestration completed successfully
    Completed(String),
    /// Orchestration failed, including nondeterminism and configuration errors
    Failed(ErrorDetails),
    /// Instance was terminated from outside
    Terminated(String),
}

impl TurnResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnResult::Continue)
    }
}

/// Everything one activation produced, ready to be committed atomically.
#[derive(Debug, Clone)]
pub struct Activation {
    pub actions: Vec<Action>,
    pub history_delta: Vec<Event>,
    pub suspended: bool,
    pub outcome: TurnResult,
}

/// Folds new work items into an instance history and re-runs the orchestration over it.
///
/// The engine is created per activation from the persisted history and never talks to a
/// store: whatever it appends is returned as a delta for the coordinator to commit.
pub struct ReplayEngine {
    instance: String,
    history: Vec<Event>,
    /// Length of the persisted history this engine was created with
    baseline_len: usize,
    pending_actions: Vec<Action>,
    next_event_id: u64,
    /// Timestamp stamped on every event appended by this activation
    now_ms: u64,
    abort_error: Option<ErrorDetails>,
    retries_scheduled: u64,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, history: Vec<Event>, now_ms: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        let baseline_len = history.len();
        Self {
            instance: instance.into(),
            history,
            baseline_len,
            pending_actions: Vec::new(),
            next_event_id,
            now_ms,
            abort_error: None,
            retries_scheduled: 0,
        }
    }

    fn push(&mut self, kind: EventKind) {
        let event = Event::new(self.next_event_id, self.now_ms, kind);
        self.next_event_id += 1;
        self.history.push(event);
    }

    fn abort(&mut self, details: ErrorDetails) {
        if self.abort_error.is_none() {
            self.abort_error = Some(details);
        }
    }

    /// Record `ExecutionStarted` for a brand-new instance. No-op once history exists.
    pub fn start(&mut self, name: &str, version: &str, input: &str) {
        if !self.history.is_empty() {
            return;
        }
        self.push(EventKind::ExecutionStarted {
            name: name.to_string(),
            version: version.to_string(),
            input: input.to_string(),
        });
    }

    pub fn orchestration_name(&self) -> Option<&str> {
        self.history.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Name, version and input recorded at start.
    pub fn started_with(&self) -> Option<(String, String, String)> {
        self.history.iter().find_map(|e| match &e.kind {
            EventKind::ExecutionStarted { name, version, input } => {
                Some((name.clone(), version.clone(), input.clone()))
            }
            _ => None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.history.iter().any(Event::is_terminal)
    }

    fn scheduling_record(&self, seq: u64) -> Option<&EventKind> {
        self.history
            .iter()
            .map(|e| &e.kind)
            .find(|k| k.is_scheduling_record() && k.seq() == Some(seq))
    }

    fn resource(&self) -> String {
        self.orchestration_name().unwrap_or(&self.instance).to_string()
    }

    /// Whether a completion for (`seq`, `attempt`) should be recorded.
    ///
    /// Redelivered work items and late reports from abandoned attempts are dropped here,
    /// so every (seq, attempt) is folded into history at most once.
    fn accepts_task_outcome(&mut self, seq: u64, attempt: u32) -> bool {
        match self.scheduling_record(seq) {
            Some(EventKind::TaskScheduled { .. }) => {}
            Some(other) => {
                let found = other.type_name();
                self.abort(ErrorDetails::nondeterminism(
                    self.resource(),
                    format!("nondeterministic: activity completion for seq {seq} but history has {found}"),
                ));
                return false;
            }
            None => {
                warn!(target: "dureplay::runtime", instance_id = %self.instance, seq, "dropping completion for unknown seq");
                return false;
            }
        }
        let completed = self
            .history
            .iter()
            .any(|e| matches!(&e.kind, EventKind::TaskCompleted { seq: s, .. } if *s == seq));
        if completed || RetryScheduler::terminal_failure(&self.history, seq).is_some() {
            debug!(target: "dureplay::runtime", instance_id = %self.instance, seq, attempt, "dropping completion for resolved seq");
            return false;
        }
        let expected = RetryScheduler::failure_count(&self.history, seq) + 1;
        if attempt != expected {
            debug!(
                target: "dureplay::runtime",
                instance_id = %self.instance,
                seq,
                attempt,
                expected,
                "dropping stale completion"
            );
            return false;
        }
        true
    }

    fn fold_task_failure(&mut self, seq: u64, attempt: u32, details: ErrorDetails) {
        self.push(EventKind::TaskFailed {
            seq,
            attempt,
            details: details.clone(),
        });
        if details.is_configuration() {
            self.abort(details);
            return;
        }
        match RetryScheduler::on_failure(&self.history, seq) {
            Some(RetryDecision::Retry {
                next_attempt,
                delay,
                fire_at_ms,
            }) => {
                debug!(
                    target: "dureplay::runtime",
                    instance_id = %self.instance,
                    seq,
                    attempt,
                    next_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling activity retry"
                );
                self.push(EventKind::TimerCreated {
                    seq,
                    fire_at_ms,
                    purpose: TimerPurpose::Retry { attempt: next_attempt },
                });
                self.pending_actions.push(Action::CreateTimer { seq, fire_at_ms });
                self.retries_scheduled += 1;
            }
            Some(RetryDecision::Exhausted { attempts, .. }) => {
                debug!(target: "dureplay::runtime", instance_id = %self.instance, seq, attempts, "activity attempts exhausted");
            }
            None => {}
        }
    }

    fn fold_timer_fired(&mut self, seq: u64, fire_at_ms: u64) {
        let purpose = self.history.iter().find_map(|e| match &e.kind {
            EventKind::TimerCreated {
                seq: s,
                fire_at_ms: f,
                purpose,
            } if *s == seq && *f == fire_at_ms => Some(purpose.clone()),
            _ => None,
        });
        let Some(purpose) = purpose else {
            warn!(target: "dureplay::runtime", instance_id = %self.instance, seq, fire_at_ms, "dropping fired timer with no matching record");
            return;
        };
        let already = self.history.iter().any(|e| {
            matches!(&e.kind, EventKind::TimerFired { seq: s, fire_at_ms: f } if *s == seq && *f == fire_at_ms)
        });
        if already {
            return;
        }
        self.push(EventKind::TimerFired { seq, fire_at_ms });

        if let TimerPurpose::Retry { attempt } = purpose {
            let scheduled = self.history.iter().find_map(|e| match &e.kind {
                EventKind::TaskScheduled { seq: s, name, input, .. } if *s == seq => Some((name.clone(), input.clone())),
                _ => None,
            });
            let resolved = self
                .history
                .iter()
                .any(|e| matches!(&e.kind, EventKind::TaskCompleted { seq: s, .. } if *s == seq));
            if let Some((name, input)) = scheduled
                && !resolved
            {
                self.pending_actions.push(Action::ScheduleActivity {
                    seq,
                    name,
                    input,
                    attempt,
                });
            }
        }
    }

    /// Fold a batch of incoming work items into history, dropping duplicates and stale items.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        for msg in messages {
            if self.abort_error.is_some() {
                break;
            }
            match msg {
                WorkItem::ActivityCompleted { seq, attempt, result, .. } => {
                    if self.accepts_task_outcome(seq, attempt) {
                        self.push(EventKind::TaskCompleted { seq, result });
                    }
                }
                WorkItem::ActivityFailed {
                    seq, attempt, details, ..
                } => {
                    if self.accepts_task_outcome(seq, attempt) {
                        self.fold_task_failure(seq, attempt, details);
                    }
                }
                WorkItem::TimerFired { seq, fire_at_ms, .. } => self.fold_timer_fired(seq, fire_at_ms),
                WorkItem::ExternalRaised {
                    raise_id, name, payload, ..
                } => {
                    if EventCorrelator::is_recorded(&self.history, &raise_id) {
                        debug!(
                            target: "dureplay::runtime",
                            instance_id = %self.instance,
                            raise_id = %raise_id,
                            event_name = %name,
                            "dropping redelivered external event"
                        );
                        continue;
                    }
                    let kind = EventCorrelator::raised(&self.history, raise_id, name, payload);
                    self.push(kind);
                }
                // Start and terminate are decided by the coordinator before replay.
                WorkItem::StartOrchestration { .. } | WorkItem::TerminateInstance { .. } => {}
                other => {
                    warn!(
                        target: "dureplay::runtime",
                        instance_id = %self.instance,
                        kind = other.kind_name(),
                        "unexpected work item on orchestrator queue"
                    );
                }
            }
        }
    }

    fn finish(&mut self, result: Result<String, ErrorDetails>) -> TurnResult {
        self.pending_actions
            .retain(|a| !matches!(a, Action::ScheduleActivity { .. } | Action::CreateTimer { .. }));
        let turn = match &result {
            Ok(output) => {
                self.pending_actions.push(Action::CompleteOrchestration { result: output.clone() });
                TurnResult::Completed(output.clone())
            }
            Err(details) => {
                self.pending_actions.push(Action::FailOrchestration {
                    details: details.clone(),
                });
                TurnResult::Failed(details.clone())
            }
        };
        self.push(EventKind::ExecutionCompleted { result });
        turn
    }

    /// Fail the instance without running orchestration code.
    pub fn fail(&mut self, details: ErrorDetails) -> TurnResult {
        self.finish(Err(details))
    }

    pub fn terminate(&mut self, reason: &str) -> TurnResult {
        self.pending_actions.clear();
        self.push(EventKind::ExecutionTerminated {
            reason: reason.to_string(),
        });
        TurnResult::Terminated(reason.to_string())
    }

    /// Re-run the orchestration from the start against the folded history.
    ///
    /// The orchestration future is polled exactly once. Durable futures resolve
    /// synchronously from history, so anything still pending after that poll is waiting
    /// on work that has not completed yet.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>, input: String) -> TurnResult {
        if let Some(details) = self.abort_error.take() {
            return self.fail(details);
        }

        let ctx = OrchestrationContext::new(self.instance.clone(), self.history.clone(), self.now_ms);
        let polled = {
            let ctx = ctx.clone();
            catch_unwind(AssertUnwindSafe(move || {
                let mut fut = handler.invoke(ctx, input);
                let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
                fut.as_mut().poll(&mut cx)
            }))
        };
        let outcome = ctx.take_outcome();

        let poll = match polled {
            Ok(poll) => poll,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(target: "dureplay::runtime", instance_id = %self.instance, %message, "orchestration panicked");
                return self.fail(ErrorDetails::Application {
                    kind: AppErrorKind::Panicked,
                    message,
                });
            }
        };

        if let Some(message) = outcome.nondeterminism_error {
            return self.fail(ErrorDetails::nondeterminism(self.resource(), message));
        }
        if let Some(details) = outcome.abort_error {
            return self.fail(details);
        }

        if let Poll::Ready(result) = &poll {
            // Everything recorded must have been re-issued before the code may finish.
            let unissued = self
                .history
                .iter()
                .find(|e| e.kind.is_scheduling_record() && e.seq().is_some_and(|s| s >= outcome.claimed));
            if let Some(event) = unissued {
                let seq = event.seq().unwrap_or_default();
                let message = format!(
                    "nondeterministic: orchestration completed but history has {} at seq {seq} that was never issued",
                    event.kind.type_name()
                );
                return self.fail(ErrorDetails::nondeterminism(self.resource(), message));
            }
            let result = result.clone();
            self.history = outcome.history;
            self.next_event_id = self.history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
            self.pending_actions.extend(outcome.actions);
            return match result {
                Ok(output) => self.finish(Ok(output)),
                Err(message) => self.finish(Err(ErrorDetails::Application {
                    kind: AppErrorKind::OrchestrationFailed,
                    message,
                })),
            };
        }

        self.history = outcome.history;
        self.next_event_id = self.history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        self.pending_actions.extend(outcome.actions);
        TurnResult::Continue
    }

    /// Fold `messages` and run one turn.
    pub fn activate(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
        messages: Vec<WorkItem>,
    ) -> Activation {
        self.prep_completions(messages);
        let outcome = if self.is_terminal() {
            TurnResult::Continue
        } else {
            self.execute_orchestration(handler, input)
        };
        Activation {
            actions: self.pending_actions.clone(),
            history_delta: self.history_delta().to_vec(),
            suspended: matches!(outcome, TurnResult::Continue),
            outcome,
        }
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history[self.baseline_len.min(self.history.len())..]
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }

    pub fn made_progress(&self) -> bool {
        !self.history_delta().is_empty() || !self.pending_actions.is_empty()
    }

    pub fn final_history(&self) -> Vec<Event> {
        self.history.clone()
    }

    /// Retry timers created while folding failures in this activation.
    pub fn retries_scheduled(&self) -> u64 {
        self.retries_scheduled
    }
}
