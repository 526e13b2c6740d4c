//! History builders and small assertions shared by the replay engine tests.

use dureplay::providers::WorkItem;
use dureplay::runtime::FnOrchestration;
use dureplay::runtime::replay_engine::{Activation, ReplayEngine, TurnResult};
use dureplay::{
    Action, ConfigErrorKind, ErrorDetails, Event, EventKind, OrchestrationContext, OrchestrationHandler, RetryPolicy,
    TimerPurpose,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const TEST_INSTANCE: &str = "test-instance";
pub const TEST_ORCH: &str = "TestOrch";
pub const TEST_INPUT: &str = "test-input";

static RAISES: AtomicU64 = AtomicU64::new(1);

/// Builds a history with consecutive event ids. Every event gets the current `at` timestamp.
pub struct HistoryBuilder {
    events: Vec<Event>,
    now: u64,
}

impl HistoryBuilder {
    pub fn started() -> Self {
        let b = Self {
            events: Vec::new(),
            now: 1_000,
        };
        b.push(EventKind::ExecutionStarted {
            name: TEST_ORCH.into(),
            version: "1.0.0".into(),
            input: TEST_INPUT.into(),
        })
    }

    pub fn at(mut self, ts: u64) -> Self {
        self.now = ts;
        self
    }

    pub fn push(mut self, kind: EventKind) -> Self {
        let id = self.events.len() as u64 + 1;
        self.events.push(Event::new(id, self.now, kind));
        self
    }

    pub fn scheduled(self, seq: u64, name: &str, input: &str) -> Self {
        self.push(EventKind::TaskScheduled {
            seq,
            name: name.into(),
            input: input.into(),
            retry: None,
        })
    }

    pub fn scheduled_with_retry(self, seq: u64, name: &str, input: &str, policy: RetryPolicy) -> Self {
        self.push(EventKind::TaskScheduled {
            seq,
            name: name.into(),
            input: input.into(),
            retry: Some(policy),
        })
    }

    pub fn completed(self, seq: u64, result: &str) -> Self {
        self.push(EventKind::TaskCompleted {
            seq,
            result: result.into(),
        })
    }

    pub fn failed(self, seq: u64, attempt: u32, message: &str) -> Self {
        self.push(EventKind::TaskFailed {
            seq,
            attempt,
            details: ErrorDetails::activity_failed(message),
        })
    }

    pub fn timer(self, seq: u64, fire_at_ms: u64) -> Self {
        self.push(EventKind::TimerCreated {
            seq,
            fire_at_ms,
            purpose: TimerPurpose::Delay,
        })
    }

    pub fn retry_timer(self, seq: u64, fire_at_ms: u64, attempt: u32) -> Self {
        self.push(EventKind::TimerCreated {
            seq,
            fire_at_ms,
            purpose: TimerPurpose::Retry { attempt },
        })
    }

    pub fn wait(self, seq: u64, name: &str, fire_at_ms: u64) -> Self {
        self.push(EventKind::TimerCreated {
            seq,
            fire_at_ms,
            purpose: TimerPurpose::EventTimeout { name: name.into() },
        })
    }

    pub fn fired(self, seq: u64, fire_at_ms: u64) -> Self {
        self.push(EventKind::TimerFired { seq, fire_at_ms })
    }

    pub fn raised(self, name: &str, payload: &str) -> Self {
        let raise_id = format!("recorded-{}", self.events.len() + 1);
        let kind = dureplay::correlator::EventCorrelator::raised(&self.events, raise_id, name, payload);
        self.push(kind)
    }

    pub fn build(self) -> Vec<Event> {
        self.events
    }
}

pub fn handler<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

/// One activation at `now_ms`.
pub fn activate(
    history: Vec<Event>,
    now_ms: u64,
    handler: Arc<dyn OrchestrationHandler>,
    messages: Vec<WorkItem>,
) -> Activation {
    let mut engine = ReplayEngine::new(TEST_INSTANCE, history, now_ms);
    engine.activate(handler, TEST_INPUT.to_string(), messages)
}

/// Persist an activation the way the coordinator would.
pub fn commit(mut history: Vec<Event>, activation: &Activation) -> Vec<Event> {
    history.extend(activation.history_delta.iter().cloned());
    history
}

pub fn task_completed(seq: u64, attempt: u32, result: &str) -> WorkItem {
    WorkItem::ActivityCompleted {
        instance: TEST_INSTANCE.into(),
        seq,
        attempt,
        result: result.into(),
    }
}

pub fn task_failed(seq: u64, attempt: u32, message: &str) -> WorkItem {
    WorkItem::ActivityFailed {
        instance: TEST_INSTANCE.into(),
        seq,
        attempt,
        details: ErrorDetails::activity_failed(message),
    }
}

pub fn timer_fired(seq: u64, fire_at_ms: u64) -> WorkItem {
    WorkItem::TimerFired {
        instance: TEST_INSTANCE.into(),
        seq,
        fire_at_ms,
    }
}

/// A raise with a fresh id, as one `Client::raise_event` call would produce.
pub fn event_raised(name: &str, payload: &str) -> WorkItem {
    let n = RAISES.fetch_add(1, Ordering::Relaxed);
    event_raised_with_id(&format!("raise-{n}"), name, payload)
}

pub fn event_raised_with_id(raise_id: &str, name: &str, payload: &str) -> WorkItem {
    WorkItem::ExternalRaised {
        instance: TEST_INSTANCE.into(),
        raise_id: raise_id.into(),
        name: name.into(),
        payload: payload.into(),
    }
}

pub fn assert_completed(activation: &Activation, expected: &str) {
    assert_eq!(activation.outcome, TurnResult::Completed(expected.to_string()));
    assert!(!activation.suspended);
    assert!(matches!(
        activation.history_delta.last().map(|e| &e.kind),
        Some(EventKind::ExecutionCompleted { result: Ok(out) }) if out == expected
    ));
}

pub fn assert_continue(activation: &Activation) {
    assert_eq!(activation.outcome, TurnResult::Continue, "expected suspension: {activation:?}");
    assert!(activation.suspended);
}

/// Nondeterminism fails the instance and records nothing the orchestration issued.
pub fn assert_nondeterminism(activation: &Activation, needle: &str) {
    match &activation.outcome {
        TurnResult::Failed(ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            message,
            ..
        }) => {
            let message = message.clone().unwrap_or_default();
            assert!(message.contains(needle), "message {message:?} should contain {needle:?}");
        }
        other => panic!("expected nondeterminism, got {other:?}"),
    }
    assert!(
        activation
            .history_delta
            .iter()
            .all(|e| !e.kind.is_scheduling_record()),
        "no scheduling records may be appended: {:?}",
        activation.history_delta
    );
    assert!(
        activation
            .actions
            .iter()
            .all(|a| matches!(a, Action::FailOrchestration { .. }))
    );
}

pub fn schedule_actions(activation: &Activation) -> Vec<(u64, String, u32)> {
    activation
        .actions
        .iter()
        .filter_map(|a| match a {
            Action::ScheduleActivity {
                seq, name, attempt, ..
            } => Some((*seq, name.clone(), *attempt)),
            _ => None,
        })
        .collect()
}
