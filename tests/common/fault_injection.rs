//! Store wrappers that inject delivery faults.

// Only some test binaries that import common use these.
#![allow(dead_code)]

use async_trait::async_trait;
use dureplay::Event;
use dureplay::providers::{
    HistoryStore, InstanceRecord, LoadedHistory, OrchestrationBatch, ProviderError, QueueKind, WorkItem,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Loses the acknowledgement of orchestrator batches that carry an external event.
///
/// The first `lose` such acks are turned into abandons after the history was already
/// committed, as if the process died between commit and ack. The batch is then
/// redelivered with the same messages.
pub struct LostAckStore {
    inner: Arc<dyn HistoryStore>,
    raise_batches: Mutex<HashSet<String>>,
    remaining: AtomicU32,
    lost: AtomicU32,
}

impl LostAckStore {
    pub fn new(inner: Arc<dyn HistoryStore>, lose: u32) -> Self {
        Self {
            inner,
            raise_batches: Mutex::new(HashSet::new()),
            remaining: AtomicU32::new(lose),
            lost: AtomicU32::new(0),
        }
    }

    /// Number of acks turned into abandons so far.
    pub fn lost_acks(&self) -> u32 {
        self.lost.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for LostAckStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        self.inner.create_instance(record).await
    }

    async fn load(&self, instance: &str) -> Result<Option<LoadedHistory>, ProviderError> {
        self.inner.load(instance).await
    }

    async fn append_if_version(
        &self,
        instance: &str,
        expected_version: u64,
        new_events: Vec<Event>,
        outbox: Vec<(QueueKind, WorkItem)>,
    ) -> Result<u64, ProviderError> {
        self.inner
            .append_if_version(instance, expected_version, new_events, outbox)
            .await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.inner.enqueue_work(kind, item).await
    }

    async fn list_ready_work_items(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        self.inner.list_ready_work_items(kind).await
    }

    async fn fetch_orchestration_batch(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<OrchestrationBatch>, ProviderError> {
        let batch = self.inner.fetch_orchestration_batch(owner, lease).await?;
        if let Some(b) = &batch
            && b.messages.iter().any(|m| matches!(m, WorkItem::ExternalRaised { .. }))
        {
            self.raise_batches.lock().unwrap().insert(b.lock_token.clone());
        }
        Ok(batch)
    }

    async fn renew_orchestration_lease(&self, lock_token: &str, lease: Duration) -> Result<(), ProviderError> {
        self.inner.renew_orchestration_lease(lock_token, lease).await
    }

    async fn ack_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        let carries_raise = self.raise_batches.lock().unwrap().remove(lock_token);
        if carries_raise
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.lost.fetch_add(1, Ordering::SeqCst);
            return self.inner.abandon_orchestration_batch(lock_token).await;
        }
        self.inner.ack_orchestration_batch(lock_token).await
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.raise_batches.lock().unwrap().remove(lock_token);
        self.inner.abandon_orchestration_batch(lock_token).await
    }

    async fn dequeue_work(&self, kind: QueueKind, lock: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.dequeue_work(kind, lock).await
    }

    async fn renew_work_lock(&self, kind: QueueKind, lock_token: &str, lock: Duration) -> Result<(), ProviderError> {
        self.inner.renew_work_lock(kind, lock_token, lock).await
    }

    async fn ack_work(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        self.inner.ack_work(kind, lock_token, completion).await
    }

    async fn abandon_work(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_work(kind, lock_token).await
    }
}

/// Permanently rejects every append that would record an activity being scheduled.
pub struct RejectSchedulingStore {
    inner: Arc<dyn HistoryStore>,
    rejected: AtomicU32,
}

impl RejectSchedulingStore {
    pub fn new(inner: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner,
            rejected: AtomicU32::new(0),
        }
    }

    pub fn rejected_appends(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for RejectSchedulingStore {
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError> {
        self.inner.create_instance(record).await
    }

    async fn load(&self, instance: &str) -> Result<Option<LoadedHistory>, ProviderError> {
        self.inner.load(instance).await
    }

    async fn append_if_version(
        &self,
        instance: &str,
        expected_version: u64,
        new_events: Vec<Event>,
        outbox: Vec<(QueueKind, WorkItem)>,
    ) -> Result<u64, ProviderError> {
        if new_events
            .iter()
            .any(|e| matches!(e.kind, dureplay::EventKind::TaskScheduled { .. }))
        {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::permanent("append_if_version", "schedule rejected"));
        }
        self.inner
            .append_if_version(instance, expected_version, new_events, outbox)
            .await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError> {
        self.inner.enqueue_work(kind, item).await
    }

    async fn list_ready_work_items(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError> {
        self.inner.list_ready_work_items(kind).await
    }

    async fn fetch_orchestration_batch(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<OrchestrationBatch>, ProviderError> {
        self.inner.fetch_orchestration_batch(owner, lease).await
    }

    async fn renew_orchestration_lease(&self, lock_token: &str, lease: Duration) -> Result<(), ProviderError> {
        self.inner.renew_orchestration_lease(lock_token, lease).await
    }

    async fn ack_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.ack_orchestration_batch(lock_token).await
    }

    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_batch(lock_token).await
    }

    async fn dequeue_work(&self, kind: QueueKind, lock: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.dequeue_work(kind, lock).await
    }

    async fn renew_work_lock(&self, kind: QueueKind, lock_token: &str, lock: Duration) -> Result<(), ProviderError> {
        self.inner.renew_work_lock(kind, lock_token, lock).await
    }

    async fn ack_work(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError> {
        self.inner.ack_work(kind, lock_token, completion).await
    }

    async fn abandon_work(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError> {
        self.inner.abandon_work(kind, lock_token).await
    }
}
