use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    HistoryStore, InstanceRecord, LoadedHistory, OrchestrationBatch, ProviderError, QueueKind, WorkItem, queue_name,
};
use crate::Event;

struct Lease {
    instance: String,
    owner: String,
    expires_at: Instant,
    messages: Vec<WorkItem>,
}

struct Locked {
    kind: QueueKind,
    item: WorkItem,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    instances: BTreeMap<String, (InstanceRecord, Vec<Event>)>,
    orchestrator_q: VecDeque<WorkItem>,
    worker_q: VecDeque<WorkItem>,
    timer_q: VecDeque<WorkItem>,
    // token -> leased batch. Messages here are invisible until ack/abandon/expiry.
    leases: HashMap<String, Lease>,
    // token -> peek-locked worker/timer item.
    locked: HashMap<String, Locked>,
    next_token: u64,
}

impl State {
    fn queue(&mut self, kind: QueueKind) -> &mut VecDeque<WorkItem> {
        match kind {
            QueueKind::Orchestrator => &mut self.orchestrator_q,
            QueueKind::Worker => &mut self.worker_q,
            QueueKind::Timer => &mut self.timer_q,
        }
    }

    fn token(&mut self, prefix: &str) -> String {
        self.next_token += 1;
        format!("{prefix}:{}", self.next_token)
    }

    /// Return expired leases and locks to the front of their queues.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(lease) = self.leases.remove(&token) {
                tracing::debug!(
                    target: "dureplay::providers::in_memory",
                    instance_id = %lease.instance,
                    owner = %lease.owner,
                    "orchestration lease expired, returning messages"
                );
                for item in lease.messages.into_iter().rev() {
                    self.orchestrator_q.push_front(item);
                }
            }
        }

        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.queue(locked.kind).push_front(locked.item);
            }
        }
    }

    fn enqueue_all(&mut self, items: Vec<(QueueKind, WorkItem)>) {
        for (kind, item) in items {
            self.queue(kind).push_back(item);
        }
    }
}

/// In-memory store. Everything is lost when the value is dropped.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    state: Mutex<State>,
}

impl InMemoryHistoryStore {
    /// Human-readable dump of every instance history, for debugging tests.
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.state.lock().await;
        let mut out = String::new();
        for (inst, (_, events)) in g.instances.iter() {
            out.push_str(&format!("instance={inst}\n"));
            for e in events {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        if g.instances.contains_key(&record.instance) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.instance),
            ));
        }
        let start = WorkItem::StartOrchestration {
            instance: record.instance.clone(),
            orchestration: record.orchestration.clone(),
            input: record.input.clone(),
        };
        g.instances.insert(record.instance.clone(), (record, Vec::new()));
        g.orchestrator_q.push_back(start);
        Ok(())
    }

    async fn load(&self, instance: &str) -> Result<Option<LoadedHistory>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(|(record, history)| LoadedHistory {
            record: record.clone(),
            history: history.clone(),
            version: history.len() as u64,
        }))
    }

    async fn append_if_version(
        &self,
        instance: &str,
        expected_version: u64,
        new_events: Vec<Event>,
        outbox: Vec<(QueueKind, WorkItem)>,
    ) -> Result<u64, ProviderError> {
        let mut g = self.state.lock().await;
        let (_, history) = g
            .instances
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append_if_version", format!("instance not found: {instance}")))?;

        let actual = history.len() as u64;
        if actual != expected_version {
            return Err(ProviderError::version_conflict(
                "append_if_version",
                instance,
                expected_version,
                actual,
            ));
        }
        if let Some(bad) = new_events
            .iter()
            .enumerate()
            .find(|(i, e)| e.event_id != actual + 1 + *i as u64)
        {
            return Err(ProviderError::permanent(
                "append_if_version",
                format!("event id {} out of sequence at version {actual}", bad.1.event_id),
            ));
        }

        history.extend(new_events);
        let version = history.len() as u64;
        g.enqueue_all(outbox);
        Ok(version)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self.state.lock().await.instances.keys().cloned().collect())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.state.lock().await.queue(kind).push_back(item);
        Ok(())
    }

    async fn list_ready_work_items(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        let mut g = self.state.lock().await;
        g.reclaim_expired(Instant::now());
        let leased: Vec<String> = g.leases.values().map(|l| l.instance.clone()).collect();
        Ok(g
            .queue(kind)
            .iter()
            .filter(|item| kind != QueueKind::Orchestrator || !leased.iter().any(|i| i == item.instance()))
            .cloned()
            .collect())
    }

    async fn fetch_orchestration_batch(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<OrchestrationBatch>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = Instant::now();
        g.reclaim_expired(now);

        let leased: Vec<String> = g.leases.values().map(|l| l.instance.clone()).collect();
        let Some(instance) = g
            .orchestrator_q
            .iter()
            .map(|item| item.instance())
            .find(|inst| !leased.iter().any(|l| l == inst))
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let (messages, rest): (VecDeque<WorkItem>, VecDeque<WorkItem>) = std::mem::take(&mut g.orchestrator_q)
            .into_iter()
            .partition(|item| item.instance() == instance);
        g.orchestrator_q = rest;
        let messages: Vec<WorkItem> = messages.into();

        let lock_token = g.token("o");
        g.leases.insert(
            lock_token.clone(),
            Lease {
                instance: instance.clone(),
                owner: owner.to_string(),
                expires_at: now + lease,
                messages: messages.clone(),
            },
        );
        Ok(Some(OrchestrationBatch {
            instance,
            lock_token,
            messages,
        }))
    }

    async fn renew_orchestration_lease(&self, lock_token: &str, lease: Duration) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let l = g
            .leases
            .get_mut(lock_token)
            .ok_or_else(|| ProviderError::permanent("renew_orchestration_lease", "lease not held"))?;
        l.expires_at = Instant::now() + lease;
        Ok(())
    }

    async fn ack_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        g.leases
            .remove(lock_token)
            .map(|_| ())
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_batch", "lease not held"))
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        let lease = g
            .leases
            .remove(lock_token)
            .ok_or_else(|| ProviderError::permanent("abandon_orchestration_batch", "lease not held"))?;
        for item in lease.messages.into_iter().rev() {
            g.orchestrator_q.push_front(item);
        }
        Ok(())
    }

    async fn dequeue_work(&self, kind: QueueKind, lock: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut g = self.state.lock().await;
        let now = Instant::now();
        g.reclaim_expired(now);
        let Some(item) = g.queue(kind).pop_front() else {
            return Ok(None);
        };
        let token = g.token(&queue_name(kind)[..1]);
        g.locked.insert(
            token.clone(),
            Locked {
                kind,
                item: item.clone(),
                expires_at: now + lock,
            },
        );
        Ok(Some((item, token)))
    }

    async fn renew_work_lock(&self, kind: QueueKind, lock_token: &str, lock: Duration) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.locked.get_mut(lock_token) {
            Some(l) if l.kind == kind => {
                l.expires_at = Instant::now() + lock;
                Ok(())
            }
            _ => Err(ProviderError::permanent("renew_work_lock", "lock not held")),
        }
    }

    async fn ack_work(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.locked.get(lock_token) {
            Some(l) if l.kind == kind => {}
            _ => return Err(ProviderError::permanent("ack_work", "lock not held")),
        }
        g.locked.remove(lock_token);
        if let Some(item) = completion {
            g.orchestrator_q.push_back(item);
        }
        Ok(())
    }

    async fn abandon_work(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        let mut g = self.state.lock().await;
        match g.locked.remove(lock_token) {
            Some(l) if l.kind == kind => {
                g.queue(kind).push_front(l.item);
                Ok(())
            }
            Some(l) => {
                g.locked.insert(lock_token.to_string(), l);
                Err(ProviderError::permanent("abandon_work", "lock held on another queue"))
            }
            None => Err(ProviderError::permanent("abandon_work", "lock not held")),
        }
    }
}
