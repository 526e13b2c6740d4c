//! Replay-based durable orchestration engine.
//!
//! Orchestrations are plain `async` functions that schedule activities, timers and
//! external-event waits through an [`OrchestrationContext`]. Every activation re-runs the
//! orchestration from the start against the persisted history of its instance: calls
//! whose outcome is already recorded resolve immediately, new calls become [`Action`]s
//! that the runtime persists and dispatches. Activities, the only place where
//! non-deterministic work belongs, run in a separate worker pool and report back through
//! the history store.
//!
//! ```rust,no_run
//! use dureplay::providers::in_memory::InMemoryHistoryStore;
//! use dureplay::runtime::{self, registry::ActivityRegistry};
//! use dureplay::{ActivityContext, Client, OrchestrationContext, OrchestrationRegistry};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryHistoryStore::default());
//! let activities = ActivityRegistry::builder()
//!     .register("Greet", |_ctx: ActivityContext, name: String| async move { Ok(format!("hello {name}")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("Hello", |ctx: OrchestrationContext, name: String| async move {
//!         ctx.schedule_activity("Greet", name).into_activity().await
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(store.clone(), Arc::new(activities), orchestrations).await;
//! let client = Client::new(store);
//! let id = client.schedule_new_orchestration("Hello", "inst-1", "world").await?;
//! let state = client.wait_for_completion(&id, std::time::Duration::from_secs(5)).await?;
//! assert_eq!(state.output.as_deref(), Some("hello world"));
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub mod client;
pub mod correlator;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError};
pub use futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use retry::{RetryDecision, RetryPolicy, RetryScheduler};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
pub use runtime::{
    ActivityHandler, OrchestrationHandler, OrchestrationState, OrchestrationStatus, Runtime, RuntimeOptions,
    WaitError,
};

/// First event of every history carries this id; ids are 1-based log positions.
pub const INITIAL_EVENT_ID: u64 = 1;

/// Application-level failure categories surfaced to orchestration code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorKind {
    ActivityFailed,
    OrchestrationFailed,
    Panicked,
}

/// Configuration failures. These are never retried and fail the whole instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigErrorKind {
    Nondeterminism,
    UnregisteredOrchestration,
    UnregisteredActivity,
}

/// Persisted description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    /// The store rejected the instance's progress permanently.
    Infrastructure {
        operation: String,
        message: String,
    },
}

impl ErrorDetails {
    pub fn activity_failed(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            kind: AppErrorKind::ActivityFailed,
            message: message.into(),
        }
    }

    pub fn nondeterminism(resource: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: resource.into(),
            message: Some(message.into()),
        }
    }

    /// Short category label used in logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    /// Activity errors and activity panics go through the retry policy; configuration
    /// failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Application {
                kind: AppErrorKind::ActivityFailed | AppErrorKind::Panicked,
                ..
            }
        )
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, ErrorDetails::Configuration { .. })
    }

    /// Message as seen by orchestration code and by status queries.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application {
                kind: AppErrorKind::Panicked,
                message,
            } => format!("panicked: {message}"),
            ErrorDetails::Application { message, .. } => message.clone(),
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                resource,
                message,
            } => message
                .clone()
                .unwrap_or_else(|| format!("nondeterministic: {resource}")),
            ErrorDetails::Configuration { resource, message, .. } => match message {
                Some(m) => format!("unregistered:{resource}: {m}"),
                None => format!("unregistered:{resource}"),
            },
            ErrorDetails::Infrastructure { operation, message } => format!("infrastructure:{operation}: {message}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

/// Why a timer was created. Retry timers share the sequence number of their activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerPurpose {
    Delay,
    EventTimeout { name: String },
    Retry { attempt: u32 },
}

/// One immutable history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 1-based position in the instance log.
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    ExecutionStarted {
        name: String,
        version: String,
        input: String,
    },
    TaskScheduled {
        seq: u64,
        name: String,
        input: String,
        retry: Option<RetryPolicy>,
    },
    TaskCompleted {
        seq: u64,
        result: String,
    },
    TaskFailed {
        seq: u64,
        attempt: u32,
        details: ErrorDetails,
    },
    TimerCreated {
        seq: u64,
        fire_at_ms: u64,
        purpose: TimerPurpose,
    },
    TimerFired {
        seq: u64,
        fire_at_ms: u64,
    },
    /// `raise_id` identifies the raise call; a redelivered raise with a recorded id is dropped.
    EventRaised {
        raise_id: String,
        name: String,
        payload: String,
        arrival_order: u64,
    },
    ExecutionCompleted {
        result: Result<String, ErrorDetails>,
    },
    ExecutionTerminated {
        reason: String,
    },
}

impl Event {
    pub fn new(event_id: u64, timestamp_ms: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp_ms,
            kind,
        }
    }

    pub fn seq(&self) -> Option<u64> {
        self.kind.seq()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ExecutionCompleted { .. } | EventKind::ExecutionTerminated { .. }
        )
    }
}

impl EventKind {
    pub fn seq(&self) -> Option<u64> {
        match self {
            EventKind::TaskScheduled { seq, .. }
            | EventKind::TaskCompleted { seq, .. }
            | EventKind::TaskFailed { seq, .. }
            | EventKind::TimerCreated { seq, .. }
            | EventKind::TimerFired { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Scheduling records claim a sequence number. Retry timers reuse their activity's.
    pub fn is_scheduling_record(&self) -> bool {
        match self {
            EventKind::TaskScheduled { .. } => true,
            EventKind::TimerCreated { purpose, .. } => !matches!(purpose, TimerPurpose::Retry { .. }),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
        }
    }

    fn describe_schedule(&self) -> String {
        match self {
            EventKind::TaskScheduled { name, input, .. } => format!("TaskScheduled('{name}','{input}')"),
            EventKind::TimerCreated {
                purpose: TimerPurpose::EventTimeout { name },
                ..
            } => format!("WaitForEvent('{name}')"),
            EventKind::TimerCreated { .. } => "TimerCreated".to_string(),
            other => other.type_name().to_string(),
        }
    }
}

/// Intents produced by one activation.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ScheduleActivity {
        seq: u64,
        name: String,
        input: String,
        attempt: u32,
    },
    CreateTimer {
        seq: u64,
        fire_at_ms: u64,
    },
    CompleteOrchestration {
        result: String,
    },
    FailOrchestration {
        details: ErrorDetails,
    },
}

#[derive(Debug)]
struct CtxInner {
    instance: String,
    history: Vec<Event>,
    /// Highest sequence number recorded before this activation, plus one.
    replay_boundary: u64,
    next_seq: u64,
    next_event_id: u64,
    now_ms: u64,
    actions: Vec<Action>,
    nondeterminism_error: Option<String>,
    abort_error: Option<ErrorDetails>,
}

impl CtxInner {
    fn new(instance: String, history: Vec<Event>, now_ms: u64) -> Self {
        let replay_boundary = history
            .iter()
            .filter(|e| e.kind.is_scheduling_record())
            .filter_map(Event::seq)
            .map(|s| s + 1)
            .max()
            .unwrap_or(0);
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        Self {
            instance,
            history,
            replay_boundary,
            next_seq: 0,
            next_event_id,
            now_ms,
            actions: Vec::new(),
            nondeterminism_error: None,
            abort_error: None,
        }
    }

    fn scheduling_record(&self, seq: u64) -> Option<&EventKind> {
        self.history
            .iter()
            .map(|e| &e.kind)
            .find(|k| k.is_scheduling_record() && k.seq() == Some(seq))
    }

    fn push_event(&mut self, kind: EventKind) {
        let event = Event::new(self.next_event_id, self.now_ms, kind);
        self.next_event_id += 1;
        self.history.push(event);
    }

    fn mismatch(&mut self, seq: u64, found: &EventKind, expected: String) {
        if self.nondeterminism_error.is_none() {
            self.nondeterminism_error = Some(format!(
                "nondeterministic: schedule order mismatch at seq {seq}: history has {} but orchestration issued {expected}",
                found.describe_schedule()
            ));
        }
    }

    fn claim_activity(&mut self, name: &str, input: &str, retry: Option<RetryPolicy>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.scheduling_record(seq).cloned() {
            Some(EventKind::TaskScheduled { name: n, input: i, .. }) if n == name && i == input => {}
            Some(found) => self.mismatch(seq, &found, format!("TaskScheduled('{name}','{input}')")),
            None => {
                self.push_event(EventKind::TaskScheduled {
                    seq,
                    name: name.to_string(),
                    input: input.to_string(),
                    retry,
                });
                self.actions.push(Action::ScheduleActivity {
                    seq,
                    name: name.to_string(),
                    input: input.to_string(),
                    attempt: 1,
                });
            }
        }
        seq
    }

    fn claim_timer(&mut self, delay: Duration, purpose: TimerPurpose) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let expected = match &purpose {
            TimerPurpose::EventTimeout { name } => format!("WaitForEvent('{name}')"),
            _ => "TimerCreated".to_string(),
        };
        match self.scheduling_record(seq).cloned() {
            Some(EventKind::TimerCreated { purpose: p, .. }) if p == purpose => {}
            Some(found) => self.mismatch(seq, &found, expected),
            None => {
                let fire_at_ms = self.now_ms.saturating_add(delay.as_millis() as u64);
                self.push_event(EventKind::TimerCreated {
                    seq,
                    fire_at_ms,
                    purpose,
                });
                self.actions.push(Action::CreateTimer { seq, fire_at_ms });
            }
        }
        seq
    }
}

/// Handle passed to orchestration code. Cheap to clone; all clones share one activation.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance: impl Into<String>, history: Vec<Event>, now_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance.into(), history, now_ms))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // A panicking orchestration is reported separately; the state itself stays usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance.clone()
    }

    /// True while the orchestration is re-issuing calls that are already in history.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.next_seq < inner.replay_boundary
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Deterministic clock: the timestamp of the most recent scheduling record the
    /// orchestration has reached, or of `ExecutionStarted` before the first call.
    pub fn current_time_ms(&self) -> u64 {
        let inner = self.lock();
        let claimed = inner.next_seq.checked_sub(1).and_then(|last| {
            inner
                .history
                .iter()
                .find(|e| e.kind.is_scheduling_record() && e.seq() == Some(last))
                .map(|e| e.timestamp_ms)
        });
        claimed
            .or_else(|| {
                inner
                    .history
                    .iter()
                    .find(|e| matches!(e.kind, EventKind::ExecutionStarted { .. }))
                    .map(|e| e.timestamp_ms)
            })
            .unwrap_or(inner.now_ms)
    }

    /// Schedule an activity without retries. A single failure resolves the call with `Err`.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let (name, input) = (name.into(), input.into());
        let seq = self.lock().claim_activity(&name, &input, None);
        DurableFuture::activity(self.clone(), seq)
    }

    /// Schedule an activity whose failures are retried with exponential backoff.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        let (name, input) = (name.into(), input.into());
        let seq = self.lock().claim_activity(&name, &input, Some(policy));
        DurableFuture::activity(self.clone(), seq)
    }

    pub fn schedule_activity_typed<In: Serialize, Out: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> ::futures::future::BoxFuture<'static, Result<Out, String>> {
        use ::futures::FutureExt;
        use _typed_codec::Codec;
        let scheduled = _typed_codec::Json::encode(input).map(|payload| self.schedule_activity(name, payload).into_activity());
        async move {
            let result = scheduled?.await?;
            _typed_codec::Json::decode::<Out>(&result)
        }
        .boxed()
    }

    /// Durable delay. Fires `delay` after the activation that first issued it.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        let seq = self.lock().claim_timer(delay, TimerPurpose::Delay);
        DurableFuture::timer(self.clone(), seq)
    }

    /// Wait for the next unconsumed event called `name`, or time out after `timeout`.
    ///
    /// The timeout is measured from the activation in which the wait was first issued
    /// and is persisted with the wait, so replays always observe the same deadline.
    pub fn wait_for_event(&self, name: impl Into<String>, timeout: Duration) -> DurableFuture {
        let name = name.into();
        let seq = self.lock().claim_timer(timeout, TimerPurpose::EventTimeout { name });
        DurableFuture::wait(self.clone(), seq)
    }

    pub fn wait_for_event_typed<T: serde::de::DeserializeOwned + Send + 'static>(
        &self,
        name: impl Into<String>,
        timeout: Duration,
    ) -> ::futures::future::BoxFuture<'static, Result<T, WaitError>> {
        use ::futures::FutureExt;
        use _typed_codec::Codec;
        let wait = self.wait_for_event(name, timeout).into_event();
        async move {
            let payload = wait.await?;
            _typed_codec::Json::decode::<T>(&payload).map_err(WaitError::Other)
        }
        .boxed()
    }

    /// Race two durable futures. The winner is whichever completion was recorded first.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(a, b)
    }

    /// Wait for all futures; outputs are returned in argument order.
    pub fn join(&self, futures: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture::new(futures)
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        crate::durable_info!(self, "{}", message.as_ref());
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        crate::durable_warn!(self, "{}", message.as_ref());
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        crate::durable_error!(self, "{}", message.as_ref());
    }

    pub(crate) fn with_history<R>(&self, f: impl FnOnce(&[Event]) -> R) -> R {
        f(&self.lock().history)
    }

    pub(crate) fn set_abort_error(&self, details: ErrorDetails) {
        let mut inner = self.lock();
        if inner.abort_error.is_none() {
            inner.abort_error = Some(details);
        }
    }

    pub(crate) fn scheduled_retry_policy(&self, seq: u64) -> Option<RetryPolicy> {
        match self.lock().scheduling_record(seq) {
            Some(EventKind::TaskScheduled { retry, .. }) => retry.clone(),
            _ => None,
        }
    }

    pub(crate) fn take_outcome(&self) -> ContextOutcome {
        let mut inner = self.lock();
        ContextOutcome {
            history: std::mem::take(&mut inner.history),
            actions: std::mem::take(&mut inner.actions),
            claimed: inner.next_seq,
            nondeterminism_error: inner.nondeterminism_error.take(),
            abort_error: inner.abort_error.take(),
        }
    }
}

/// What an activation left behind in its context.
pub(crate) struct ContextOutcome {
    pub history: Vec<Event>,
    pub actions: Vec<Action>,
    pub claimed: u64,
    pub nondeterminism_error: Option<String>,
    pub abort_error: Option<ErrorDetails>,
}

/// Passed to activity code. Activities may be non-deterministic.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance: String,
    seq: u64,
    attempt: u32,
    name: String,
}

impl ActivityContext {
    pub fn new(instance: impl Into<String>, seq: u64, attempt: u32, name: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            seq,
            attempt,
            name: name.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 1-based attempt number, derived from the persisted failure count.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn activity_name(&self) -> &str {
        &self.name
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        tracing::info!(
            target: "dureplay::activity",
            instance_id = %self.instance,
            activity_name = %self.name,
            seq = self.seq,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        tracing::warn!(
            target: "dureplay::activity",
            instance_id = %self.instance,
            activity_name = %self.name,
            seq = self.seq,
            attempt = self.attempt,
            "{}",
            message.as_ref()
        );
    }
}

/// JSON payload codec for the typed helpers.
pub mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
        }
    }
}
