use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use crate::providers::{HistoryStore, QueueKind, WorkItem};

/// A `TimerSchedule` item taken from the timer queue together with its peek-lock token.
pub(crate) struct LockedTimer {
    pub item: WorkItem,
    pub lock_token: String,
}

struct Pending {
    instance: String,
    seq: u64,
    lock_token: String,
}

/// In-process timer service.
/// Keeps a min-ordered queue of locked TimerSchedule items and, when one is due, acks it
/// with a TimerFired completion so both happen in one store operation.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    rx: tokio::sync::mpsc::UnboundedReceiver<LockedTimer>,
    // keyed by "inst|seq|fire_at_ms"
    items: HashMap<String, Pending>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    poller_idle_ms: u64,
}

impl TimerService {
    pub(crate) fn start(
        store: Arc<dyn HistoryStore>,
        poller_idle_ms: u64,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedSender<LockedTimer>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<LockedTimer>();
        let mut svc = TimerService {
            store,
            rx,
            items: HashMap::new(),
            min_heap: BinaryHeap::new(),
            poller_idle_ms,
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(timer) = self.rx.try_recv() {
                self.insert_item(timer);
            }

            let now = super::now_ms();
            let mut due: Vec<(Pending, u64)> = Vec::new();
            while let Some(Reverse((ts, key))) = self.min_heap.peek().cloned() {
                if ts <= now {
                    let _ = self.min_heap.pop();
                    if let Some(pending) = self.items.remove(&key) {
                        due.push((pending, ts));
                    }
                } else {
                    break;
                }
            }

            for (pending, fire_at_ms) in due.drain(..) {
                self.fire(pending, fire_at_ms).await;
            }

            if let Some(Reverse((next_ts, _))) = self.min_heap.peek().cloned() {
                let now = super::now_ms();
                let dur_ms = next_ts.saturating_sub(now).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(dur_ms)) => {},
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(timer) => self.insert_item(timer),
                            _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                        }
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(timer) => self.insert_item(timer),
                    _ => tokio::time::sleep(std::time::Duration::from_millis(self.poller_idle_ms)).await,
                }
            }
        }
    }

    async fn fire(&self, pending: Pending, fire_at_ms: u64) {
        let fired = WorkItem::TimerFired {
            instance: pending.instance.clone(),
            seq: pending.seq,
            fire_at_ms,
        };
        tracing::debug!(
            target: "dureplay::runtime::timers",
            instance_id = %pending.instance,
            seq = pending.seq,
            fire_at_ms,
            "timer fired"
        );
        if let Err(e) = self
            .store
            .ack_work(QueueKind::Timer, &pending.lock_token, Some(fired.clone()))
            .await
        {
            // Lock lost: the schedule will be redelivered, and the replay engine drops the
            // duplicate firing.
            tracing::warn!(
                target: "dureplay::runtime::timers",
                instance_id = %pending.instance,
                seq = pending.seq,
                error = %e,
                "timer ack failed, enqueueing firing directly"
            );
            if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, fired).await {
                tracing::error!(
                    target: "dureplay::runtime::timers",
                    instance_id = %pending.instance,
                    seq = pending.seq,
                    error = %e,
                    "failed to enqueue timer firing"
                );
            }
        }
    }

    fn insert_item(&mut self, timer: LockedTimer) {
        if let WorkItem::TimerSchedule {
            instance,
            seq,
            fire_at_ms,
        } = timer.item
        {
            let key = format!("{instance}|{seq}|{fire_at_ms}");
            match self.items.get_mut(&key) {
                // Redelivered after the lock expired; only the newest token can still ack.
                Some(pending) => pending.lock_token = timer.lock_token,
                None => {
                    self.min_heap.push(Reverse((fire_at_ms, key.clone())));
                    self.items.insert(
                        key,
                        Pending {
                            instance,
                            seq,
                            lock_token: timer.lock_token,
                        },
                    );
                }
            }
        }
    }
}
