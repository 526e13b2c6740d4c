use super::helpers::*;
use dureplay::{Action, EventKind, OrchestrationContext, TimerPurpose, WaitError};
use std::time::Duration;

fn wait_once(name: &'static str) -> std::sync::Arc<dyn dureplay::OrchestrationHandler> {
    handler(move |ctx: OrchestrationContext, _input: String| async move {
        match ctx.wait_for_event(name, Duration::from_secs(30)).into_event().await {
            Ok(payload) => Ok(payload),
            Err(WaitError::Timeout) => Ok("timeout".to_string()),
            Err(e) => Err(e.to_string()),
        }
    })
}

fn wait_twice() -> std::sync::Arc<dyn dureplay::OrchestrationHandler> {
    handler(|ctx: OrchestrationContext, _input: String| async move {
        let a = ctx
            .wait_for_event("Go", Duration::from_secs(30))
            .into_event()
            .await
            .map_err(|e| e.to_string())?;
        let b = ctx
            .wait_for_event("Go", Duration::from_secs(30))
            .into_event()
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("{a},{b}"))
    })
}

#[test]
fn wait_records_timeout_timer_from_first_activation() {
    let act = activate(HistoryBuilder::started().build(), 5_000, wait_once("Go"), vec![]);
    assert_continue(&act);
    assert!(matches!(
        &act.history_delta[0].kind,
        EventKind::TimerCreated {
            seq: 0,
            fire_at_ms: 35_000,
            purpose: TimerPurpose::EventTimeout { name }
        } if name == "Go"
    ));
    assert_eq!(act.actions, vec![Action::CreateTimer { seq: 0, fire_at_ms: 35_000 }]);

    // Replaying much later keeps the recorded deadline and creates nothing new.
    let history = commit(HistoryBuilder::started().build(), &act);
    let replay = activate(history, 90_000, wait_once("Go"), vec![]);
    assert_continue(&replay);
    assert!(replay.history_delta.is_empty());
    assert!(replay.actions.is_empty());
}

#[test]
fn raised_event_resolves_open_wait() {
    let history = HistoryBuilder::started().wait(0, "Go", 31_000).build();
    let act = activate(history, 2_000, wait_once("Go"), vec![event_raised("Go", "yes")]);
    assert_completed(&act, "yes");
    assert!(matches!(
        &act.history_delta[0].kind,
        EventKind::EventRaised { arrival_order: 1, .. }
    ));
}

#[test]
fn early_event_is_buffered_for_later_wait() {
    // The event arrives while the orchestration is still waiting on an activity.
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Prep", "x").into_activity().await?;
        ctx.wait_for_event("Go", Duration::from_secs(30))
            .into_event()
            .await
            .map_err(|e| e.to_string())
    });
    let history = HistoryBuilder::started().scheduled(0, "Prep", "x").build();
    let early = activate(history.clone(), 2_000, h.clone(), vec![event_raised("Go", "early")]);
    assert_continue(&early);
    let history = commit(history, &early);

    let act = activate(history, 3_000, h, vec![task_completed(0, 1, "ok")]);
    assert_completed(&act, "early");
}

#[test]
fn events_with_same_name_are_consumed_fifo() {
    let history = HistoryBuilder::started().build();
    let act = activate(
        history,
        2_000,
        wait_twice(),
        vec![event_raised("Go", "first"), event_raised("Go", "second")],
    );
    assert_completed(&act, "first,second");
    let orders: Vec<u64> = act
        .history_delta
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::EventRaised { arrival_order, .. } => Some(arrival_order),
            _ => None,
        })
        .collect();
    assert_eq!(orders, vec![1, 2]);
}

#[test]
fn timeout_fires_before_event() {
    let history = HistoryBuilder::started().wait(0, "Go", 31_000).build();
    let act = activate(history, 31_000, wait_once("Go"), vec![timer_fired(0, 31_000)]);
    assert_completed(&act, "timeout");
}

#[test]
fn event_after_timeout_stays_buffered() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let first = match ctx.wait_for_event("Go", Duration::from_secs(30)).into_event().await {
            Ok(p) => p,
            Err(WaitError::Timeout) => "timeout".to_string(),
            Err(e) => return Err(e.to_string()),
        };
        let second = ctx
            .wait_for_event("Go", Duration::from_secs(30))
            .into_event()
            .await
            .map_err(|e| e.to_string())?;
        Ok(format!("{first},{second}"))
    });
    let history = HistoryBuilder::started().wait(0, "Go", 31_000).build();
    // Timer firing and the late event land in the same batch; history order decides.
    let act = activate(
        history,
        31_000,
        h,
        vec![timer_fired(0, 31_000), event_raised("Go", "late")],
    );
    assert_completed(&act, "timeout,late");
}

#[test]
fn unrelated_event_names_do_not_match() {
    let history = HistoryBuilder::started().wait(0, "Go", 31_000).build();
    let act = activate(history, 2_000, wait_once("Go"), vec![event_raised("Stop", "x")]);
    assert_continue(&act);
    assert_eq!(act.history_delta.len(), 1);
    assert!(act.actions.is_empty());
}

#[test]
fn redelivered_raise_is_folded_once() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let first = ctx
            .wait_for_event("go", Duration::from_secs(60))
            .into_event()
            .await
            .map_err(|e| e.to_string())?;
        let second = match ctx.wait_for_event("go", Duration::from_millis(300)).into_event().await {
            Ok(p) => p,
            Err(WaitError::Timeout) => "TIMEOUT".to_string(),
            Err(e) => return Err(e.to_string()),
        };
        Ok(format!("{first}|{second}"))
    });
    let raise = event_raised_with_id("raise-1", "go", "p1");

    let history = HistoryBuilder::started().wait(0, "go", 61_000).build();
    let delivered = activate(history.clone(), 2_000, h.clone(), vec![raise.clone(), raise.clone()]);
    assert_continue(&delivered);
    let raised = delivered
        .history_delta
        .iter()
        .filter(|e| matches!(e.kind, EventKind::EventRaised { .. }))
        .count();
    assert_eq!(raised, 1, "duplicates within one batch fold once");
    let history = commit(history, &delivered);
    let fire_at = history
        .iter()
        .find_map(|e| match e.kind {
            EventKind::TimerCreated { seq: 1, fire_at_ms, .. } => Some(fire_at_ms),
            _ => None,
        })
        .unwrap();
    assert_eq!(fire_at, 2_300);

    // Same raise again after its batch was committed but never acknowledged.
    let redelivered = activate(history.clone(), 2_100, h.clone(), vec![raise]);
    assert_continue(&redelivered);
    assert!(redelivered.history_delta.is_empty());
    assert!(redelivered.actions.is_empty());

    let act = activate(history, 2_300, h, vec![timer_fired(1, 2_300)]);
    assert_completed(&act, "p1|TIMEOUT");
}
