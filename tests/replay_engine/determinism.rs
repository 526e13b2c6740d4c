use super::helpers::*;
use dureplay::{Action, DurableOutput, EventKind, OrchestrationContext};
use std::time::Duration;

fn two_step() -> std::sync::Arc<dyn dureplay::OrchestrationHandler> {
    handler(|ctx: OrchestrationContext, _input: String| async move {
        let a = ctx.schedule_activity("A", "1").into_activity().await?;
        let b = ctx.schedule_activity("B", a).into_activity().await?;
        Ok(b)
    })
}

#[test]
fn fresh_start_schedules_first_activity() {
    let h = handler(|ctx: OrchestrationContext, input: String| async move {
        ctx.schedule_activity("Greet", input).into_activity().await
    });
    let act = activate(HistoryBuilder::started().build(), 2_000, h, vec![]);

    assert_continue(&act);
    assert_eq!(act.history_delta.len(), 1);
    let scheduled = &act.history_delta[0];
    assert_eq!(scheduled.event_id, 2);
    assert_eq!(scheduled.timestamp_ms, 2_000);
    assert!(matches!(
        &scheduled.kind,
        EventKind::TaskScheduled { seq: 0, name, input, retry: None } if name == "Greet" && input == TEST_INPUT
    ));
    assert_eq!(schedule_actions(&act), vec![(0, "Greet".to_string(), 1)]);
}

#[test]
fn recorded_completion_resolves_without_new_side_effect() {
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "1")
        .completed(0, "ra")
        .build();
    let act = activate(history.clone(), 5_000, two_step(), vec![]);

    assert_continue(&act);
    // Only the second call is new; "A" is not dispatched again.
    assert_eq!(schedule_actions(&act), vec![(1, "B".to_string(), 1)]);
    assert!(matches!(
        &act.history_delta[..],
        [e] if matches!(&e.kind, EventKind::TaskScheduled { seq: 1, input, .. } if input == "ra")
    ));

    let history = commit(history, &act);
    let done = activate(history, 6_000, two_step(), vec![task_completed(1, 1, "rb")]);
    assert_completed(&done, "rb");
    assert_eq!(done.history_delta.len(), 2);
    assert_eq!(done.actions, vec![Action::CompleteOrchestration { result: "rb".into() }]);
}

#[test]
fn several_unresolved_actions_before_suspension() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let outs = ctx
            .join(vec![
                ctx.schedule_activity("A", "a"),
                ctx.schedule_activity("B", "b"),
                ctx.schedule_activity("C", "c"),
            ])
            .await;
        Ok(format!("{}", outs.len()))
    });
    let act = activate(HistoryBuilder::started().build(), 2_000, h, vec![]);

    assert_continue(&act);
    assert_eq!(
        schedule_actions(&act),
        vec![(0, "A".to_string(), 1), (1, "B".to_string(), 1), (2, "C".to_string(), 1)]
    );
}

#[test]
fn one_activation_resolves_several_awaits() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let outs = ctx
            .join(vec![ctx.schedule_activity("A", "a"), ctx.schedule_activity("B", "b")])
            .await;
        let parts: Vec<String> = outs
            .into_iter()
            .map(|o| match o {
                DurableOutput::Activity(Ok(s)) => s,
                other => format!("{other:?}"),
            })
            .collect();
        Ok(parts.join("+"))
    });
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "a")
        .scheduled(1, "B", "b")
        .build();
    // Completions arrive in reverse order; join still reports argument order.
    let act = activate(
        history,
        3_000,
        h,
        vec![task_completed(1, 1, "rb"), task_completed(0, 1, "ra")],
    );
    assert_completed(&act, "ra+rb");
}

#[test]
fn same_history_gives_same_decisions() {
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "1")
        .completed(0, "ra")
        .build();
    let first = activate(history.clone(), 7_000, two_step(), vec![]);
    let second = activate(history.clone(), 7_000, two_step(), vec![]);
    assert_eq!(first.history_delta, second.history_delta);
    assert_eq!(first.actions, second.actions);

    // A later clock only changes timestamps, never which calls are made.
    let later = activate(history, 99_000, two_step(), vec![]);
    assert_eq!(later.actions, first.actions);
    let kinds = |a: &dureplay::runtime::replay_engine::Activation| {
        a.history_delta.iter().map(|e| e.kind.clone()).collect::<Vec<_>>()
    };
    assert_eq!(kinds(&later), kinds(&first));
}

#[test]
fn select_prefers_earlier_recorded_outcome() {
    let racer = || {
        handler(|ctx: OrchestrationContext, _input: String| async move {
            let act = ctx.schedule_activity("Slow", "x");
            let timer = ctx.schedule_timer(Duration::from_secs(5));
            let (idx, _) = ctx.select2(act, timer).await;
            Ok(idx.to_string())
        })
    };

    let timer_first = HistoryBuilder::started()
        .scheduled(0, "Slow", "x")
        .timer(1, 6_000)
        .fired(1, 6_000)
        .completed(0, "late")
        .build();
    assert_completed(&activate(timer_first, 9_000, racer(), vec![]), "1");

    let activity_first = HistoryBuilder::started()
        .scheduled(0, "Slow", "x")
        .timer(1, 6_000)
        .completed(0, "early")
        .fired(1, 6_000)
        .build();
    assert_completed(&activate(activity_first, 9_000, racer(), vec![]), "0");
}

#[test]
fn current_time_comes_from_history() {
    let h = || {
        handler(|ctx: OrchestrationContext, _input: String| async move {
            let before = ctx.current_time_ms();
            ctx.schedule_activity("A", "x").into_activity().await?;
            Ok(format!("{before},{}", ctx.current_time_ms()))
        })
    };
    let history = HistoryBuilder::started()
        .at(2_000)
        .scheduled(0, "A", "x")
        .at(3_000)
        .completed(0, "r")
        .build();

    assert_completed(&activate(history.clone(), 50_000, h(), vec![]), "1000,2000");
    assert_completed(&activate(history, 90_000, h(), vec![]), "1000,2000");
}

#[test]
fn is_replaying_flips_after_recorded_calls() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let first = ctx.is_replaying();
        ctx.schedule_activity("A", "x").into_activity().await?;
        let second = ctx.is_replaying();
        Ok(format!("{first},{second}"))
    });
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "x")
        .completed(0, "r")
        .build();
    assert_completed(&activate(history, 5_000, h, vec![]), "true,false");
}

#[test]
fn unawaited_call_is_still_recorded_and_dispatched() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let _fire_and_forget = ctx.schedule_activity("Audit", "x");
        ctx.schedule_activity("A", "y").into_activity().await
    });
    let act = activate(HistoryBuilder::started().build(), 2_000, h, vec![]);
    assert_continue(&act);
    assert_eq!(
        schedule_actions(&act),
        vec![(0, "Audit".to_string(), 1), (1, "A".to_string(), 1)]
    );
}

#[test]
fn duplicate_completion_is_ignored() {
    let history = HistoryBuilder::started()
        .scheduled(0, "A", "1")
        .completed(0, "ra")
        .scheduled(1, "B", "ra")
        .build();
    let act = activate(
        history,
        8_000,
        two_step(),
        vec![task_completed(0, 1, "again"), task_completed(1, 1, "rb"), task_completed(1, 1, "rb")],
    );
    assert_completed(&act, "rb");
    let completions = act
        .history_delta
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TaskCompleted { .. }))
        .count();
    assert_eq!(completions, 1);
}
