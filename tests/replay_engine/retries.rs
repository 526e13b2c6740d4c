use super::helpers::*;
use dureplay::runtime::replay_engine::TurnResult;
use dureplay::providers::WorkItem;
use dureplay::{Action, ConfigErrorKind, ErrorDetails, EventKind, OrchestrationContext, RetryPolicy, TimerPurpose};
use std::time::Duration;

fn demo_policy() -> RetryPolicy {
    RetryPolicy::new(5)
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(10))
        .with_backoff_coefficient(2.0)
}

fn flaky(policy: RetryPolicy) -> std::sync::Arc<dyn dureplay::OrchestrationHandler> {
    handler(move |ctx: OrchestrationContext, _input: String| {
        let policy = policy.clone();
        async move {
            match ctx
                .schedule_activity_with_retry("Flaky", "payload", policy)
                .into_activity()
                .await
            {
                Ok(v) => Ok(v),
                Err(e) => Ok(format!("gave up: {e}")),
            }
        }
    })
}

#[test]
fn failure_creates_retry_timer_anchored_at_failure() {
    let history = HistoryBuilder::started()
        .scheduled_with_retry(0, "Flaky", "payload", demo_policy())
        .build();
    let act = activate(history, 10_000, flaky(demo_policy()), vec![task_failed(0, 1, "E1")]);

    assert_continue(&act);
    let kinds: Vec<&EventKind> = act.history_delta.iter().map(|e| &e.kind).collect();
    assert!(matches!(kinds[0], EventKind::TaskFailed { seq: 0, attempt: 1, .. }));
    assert!(matches!(
        kinds[1],
        EventKind::TimerCreated {
            seq: 0,
            fire_at_ms: 11_000,
            purpose: TimerPurpose::Retry { attempt: 2 }
        }
    ));
    assert_eq!(act.actions, vec![Action::CreateTimer { seq: 0, fire_at_ms: 11_000 }]);
}

#[test]
fn retry_timer_reschedules_with_original_input() {
    let history = HistoryBuilder::started()
        .scheduled_with_retry(0, "Flaky", "payload", demo_policy())
        .at(10_000)
        .failed(0, 1, "E1")
        .retry_timer(0, 11_000, 2)
        .build();
    let act = activate(history, 11_005, flaky(demo_policy()), vec![timer_fired(0, 11_000)]);

    assert_continue(&act);
    assert_eq!(
        act.actions,
        vec![Action::ScheduleActivity {
            seq: 0,
            name: "Flaky".into(),
            input: "payload".into(),
            attempt: 2,
        }]
    );
    // Retries do not claim new sequence numbers.
    assert!(act.history_delta.iter().all(|e| !e.kind.is_scheduling_record()));
}

#[test]
fn backoff_doubles_until_success() {
    let h = flaky(demo_policy());
    let mut history = HistoryBuilder::started().build();
    let mut now = 1_000;

    let first = activate(history.clone(), now, h.clone(), vec![]);
    history = commit(history, &first);

    let mut delays = Vec::new();
    for attempt in 1..=3u32 {
        now += 500;
        let failed = activate(history.clone(), now, h.clone(), vec![task_failed(0, attempt, "boom")]);
        let fire_at = failed
            .actions
            .iter()
            .find_map(|a| match a {
                Action::CreateTimer { fire_at_ms, .. } => Some(*fire_at_ms),
                _ => None,
            })
            .expect("retry timer");
        delays.push(fire_at - now);
        history = commit(history, &failed);

        now = fire_at;
        let fired = activate(history.clone(), now, h.clone(), vec![timer_fired(0, fire_at)]);
        assert_eq!(schedule_actions(&fired), vec![(0, "Flaky".to_string(), attempt + 1)]);
        history = commit(history, &fired);
    }
    assert_eq!(delays, vec![1_000, 2_000, 4_000]);

    let done = activate(history, now + 10, h, vec![task_completed(0, 4, "finally")]);
    assert_completed(&done, "finally");
}

#[test]
fn exhausted_retries_surface_last_error() {
    let policy = RetryPolicy::new(2).with_initial_interval(Duration::from_millis(100));
    let history = HistoryBuilder::started()
        .scheduled_with_retry(0, "Flaky", "payload", policy.clone())
        .at(2_000)
        .failed(0, 1, "E1")
        .retry_timer(0, 2_100, 2)
        .fired(0, 2_100)
        .build();
    let act = activate(history, 3_000, flaky(policy), vec![task_failed(0, 2, "E2")]);
    assert_completed(&act, "gave up: E2");
    assert!(
        !act.history_delta
            .iter()
            .any(|e| matches!(e.kind, EventKind::TimerCreated { .. }))
    );
}

#[test]
fn no_policy_means_single_attempt() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Once", "x").into_activity().await
    });
    let history = HistoryBuilder::started().scheduled(0, "Once", "x").build();
    let act = activate(history, 2_000, h, vec![task_failed(0, 1, "nope")]);
    match act.outcome {
        TurnResult::Failed(ErrorDetails::Application { message, .. }) => assert_eq!(message, "nope"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn stale_attempt_report_is_dropped() {
    let history = HistoryBuilder::started()
        .scheduled_with_retry(0, "Flaky", "payload", demo_policy())
        .at(10_000)
        .failed(0, 1, "E1")
        .retry_timer(0, 11_000, 2)
        .build();
    // A redelivered report for attempt 1 must not count as a second failure.
    let act = activate(
        history,
        10_500,
        flaky(demo_policy()),
        vec![task_failed(0, 1, "E1"), task_completed(0, 1, "late")],
    );
    assert_continue(&act);
    assert!(act.history_delta.is_empty());
    assert!(act.actions.is_empty());
}

#[test]
fn configuration_failure_is_never_retried() {
    let history = HistoryBuilder::started()
        .scheduled_with_retry(0, "Flaky", "payload", demo_policy())
        .build();
    let act = activate(
        history,
        2_000,
        flaky(demo_policy()),
        vec![WorkItem::ActivityFailed {
            instance: TEST_INSTANCE.into(),
            seq: 0,
            attempt: 1,
            details: ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: "Flaky".into(),
                message: None,
            },
        }],
    );
    assert!(matches!(
        act.outcome,
        TurnResult::Failed(ErrorDetails::Configuration {
            kind: ConfigErrorKind::UnregisteredActivity,
            ..
        })
    ));
    assert!(
        !act.actions
            .iter()
            .any(|a| matches!(a, Action::CreateTimer { .. } | Action::ScheduleActivity { .. }))
    );
}
