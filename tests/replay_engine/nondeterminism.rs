use super::helpers::*;
use dureplay::runtime::replay_engine::TurnResult;
use dureplay::{AppErrorKind, ErrorDetails, EventKind, OrchestrationContext};
use std::time::Duration;

#[test]
fn renamed_activity_is_detected() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Renamed", "x").into_activity().await
    });
    let history = HistoryBuilder::started().scheduled(0, "Original", "x").build();
    let act = activate(history, 2_000, h, vec![]);
    assert_nondeterminism(&act, "Original");
    assert!(matches!(
        act.history_delta.last().map(|e| &e.kind),
        Some(EventKind::ExecutionCompleted { result: Err(_) })
    ));
}

#[test]
fn changed_input_is_detected() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("A", "new-input").into_activity().await
    });
    let history = HistoryBuilder::started().scheduled(0, "A", "old-input").build();
    assert_nondeterminism(&activate(history, 2_000, h, vec![]), "seq 0");
}

#[test]
fn timer_swapped_for_activity_is_detected() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("A", "x").into_activity().await
    });
    let history = HistoryBuilder::started().timer(0, 5_000).build();
    assert_nondeterminism(&activate(history, 2_000, h, vec![]), "TimerCreated");
}

#[test]
fn wait_for_different_event_is_detected() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.wait_for_event("Other", Duration::from_secs(5))
            .into_event()
            .await
            .map_err(|e| e.to_string())
    });
    let history = HistoryBuilder::started().wait(0, "Approval", 6_000).build();
    assert_nondeterminism(&activate(history, 2_000, h, vec![]), "Approval");
}

#[test]
fn completing_with_unissued_recorded_calls_is_detected() {
    let h = handler(|_ctx: OrchestrationContext, _input: String| async move { Ok("skipped".to_string()) });
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "x")
        .completed(0, "r")
        .build();
    assert_nondeterminism(&activate(history, 2_000, h, vec![]), "never issued");
}

#[test]
fn activity_completion_for_timer_seq_is_detected() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_timer(Duration::from_secs(1)).into_timer().await;
        Ok("done".to_string())
    });
    let history = HistoryBuilder::started().timer(0, 3_000).build();
    let act = activate(history, 2_000, h, vec![task_completed(0, 1, "bogus")]);
    assert_nondeterminism(&act, "TimerCreated");
}

#[test]
fn orchestration_panic_fails_instance() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let v = ctx.schedule_activity("A", "x").into_activity().await?;
        if v == "bad" {
            panic!("cannot handle {v}");
        }
        Ok(v)
    });
    let history = HistoryBuilder::started().scheduled(0, "A", "x").build();
    let act = activate(history, 2_000, h, vec![task_completed(0, 1, "bad")]);
    match &act.outcome {
        TurnResult::Failed(ErrorDetails::Application {
            kind: AppErrorKind::Panicked,
            message,
        }) => assert!(message.contains("cannot handle bad")),
        other => panic!("unexpected {other:?}"),
    }
    // The completion that triggered the panic is still recorded.
    assert!(
        act.history_delta
            .iter()
            .any(|e| matches!(e.kind, EventKind::TaskCompleted { seq: 0, .. }))
    );
}
