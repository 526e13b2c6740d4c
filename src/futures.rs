use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::correlator::{EventCorrelator, WaitResolution};
use crate::retry::RetryScheduler;
use crate::runtime::WaitError;
use crate::{ErrorDetails, Event, EventKind, OrchestrationContext};

/// Value produced by a resolved [`DurableFuture`].
#[derive(Debug, Clone, PartialEq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    Event(Result<String, WaitError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Activity,
    Timer,
    Wait,
}

/// Future for one scheduling call.
///
/// The sequence number and the scheduling record are claimed when the call is made, not
/// when the future is first polled. Polling only looks the outcome up in history, so a
/// future resolves to the same value no matter how often or in which order it is polled.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    seq: u64,
    kind: Kind,
}

impl DurableFuture {
    pub(crate) fn activity(ctx: OrchestrationContext, seq: u64) -> Self {
        Self {
            ctx,
            seq,
            kind: Kind::Activity,
        }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, seq: u64) -> Self {
        Self {
            ctx,
            seq,
            kind: Kind::Timer,
        }
    }

    pub(crate) fn wait(ctx: OrchestrationContext, seq: u64) -> Self {
        Self {
            ctx,
            seq,
            kind: Kind::Wait,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Await as an activity result. Retries happen underneath; `Err` means the call is exhausted.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(result) => result,
            other => Err(format!("expected an activity outcome, got {other:?}")),
        }
    }

    pub async fn into_timer(self) {
        let _ = self.await;
    }

    /// Await as a wait-for-event result. A timeout yields `Err(WaitError::Timeout)`.
    pub async fn into_event(self) -> Result<String, WaitError> {
        match self.await {
            DurableOutput::Event(result) => result,
            other => Err(WaitError::Other(format!("expected an event outcome, got {other:?}"))),
        }
    }

    /// Outcome recorded for this call and the event id at which it became visible.
    fn resolve(&self) -> Option<(u64, DurableOutput)> {
        match self.kind {
            Kind::Activity => match self.ctx.with_history(|h| activity_outcome(h, self.seq)) {
                Ok(found) => found,
                Err(details) => {
                    // Configuration failures never reach orchestration code.
                    self.ctx.set_abort_error(details);
                    None
                }
            },
            Kind::Timer => self.ctx.with_history(|h| {
                h.iter().find_map(|e| match e.kind {
                    EventKind::TimerFired { seq, .. } if seq == self.seq => Some((e.event_id, DurableOutput::Timer)),
                    _ => None,
                })
            }),
            Kind::Wait => self
                .ctx
                .with_history(|h| EventCorrelator::correlate(h).resolution(self.seq).cloned())
                .map(|r| match r {
                    WaitResolution::Raised { payload, resolved_at } => (resolved_at, DurableOutput::Event(Ok(payload))),
                    WaitResolution::TimedOut { resolved_at } => {
                        (resolved_at, DurableOutput::Event(Err(WaitError::Timeout)))
                    }
                }),
        }
    }
}

fn activity_outcome(history: &[Event], seq: u64) -> Result<Option<(u64, DurableOutput)>, ErrorDetails> {
    if let Some(done) = history.iter().find_map(|e| match &e.kind {
        EventKind::TaskCompleted { seq: s, result } if *s == seq => {
            Some((e.event_id, DurableOutput::Activity(Ok(result.clone()))))
        }
        _ => None,
    }) {
        return Ok(Some(done));
    }

    match RetryScheduler::terminal_failure(history, seq) {
        Some(details) if details.is_configuration() => Err(details),
        Some(details) => {
            let failed_at = history
                .iter()
                .rev()
                .find(|e| matches!(&e.kind, EventKind::TaskFailed { seq: s, .. } if *s == seq))
                .map(|e| e.event_id)
                .unwrap_or_default();
            Ok(Some((failed_at, DurableOutput::Activity(Err(details.display_message())))))
        }
        None => Ok(None),
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.resolve() {
            Some((_, output)) => Poll::Ready(output),
            None => Poll::Pending,
        }
    }
}

const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<DurableFuture>();
};

/// Race of two durable futures; see [`OrchestrationContext::select2`].
///
/// Output is `(winner_index, output)`. The winner is the future whose outcome appears
/// earlier in history, which keeps the choice stable across replays even when both
/// outcomes are already recorded.
pub struct SelectFuture {
    a: DurableFuture,
    b: DurableFuture,
}

impl SelectFuture {
    pub(crate) fn new(a: DurableFuture, b: DurableFuture) -> Self {
        Self { a, b }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match (self.a.resolve(), self.b.resolve()) {
            (Some((pa, oa)), Some((pb, ob))) => {
                if pb < pa {
                    Poll::Ready((1, ob))
                } else {
                    Poll::Ready((0, oa))
                }
            }
            (Some((_, oa)), None) => Poll::Ready((0, oa)),
            (None, Some((_, ob))) => Poll::Ready((1, ob)),
            (None, None) => Poll::Pending,
        }
    }
}

/// Completes once every child has an outcome; see [`OrchestrationContext::join`].
pub struct JoinFuture {
    children: Vec<DurableFuture>,
}

impl JoinFuture {
    pub(crate) fn new(children: Vec<DurableFuture>) -> Self {
        Self { children }
    }
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut outputs = Vec::with_capacity(self.children.len());
        for child in &self.children {
            match child.resolve() {
                Some((_, output)) => outputs.push(output),
                None => return Poll::Pending,
            }
        }
        Poll::Ready(outputs)
    }
}
