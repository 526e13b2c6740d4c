use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ErrorDetails, Event};

mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider: one JSON-lines history log per instance.
pub mod fs;

/// Messages exchanged between the client, the coordinator, the activity workers and the
/// timer service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        seq: u64,
        attempt: u32,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        seq: u64,
        attempt: u32,
        result: String,
    },
    ActivityFailed {
        instance: String,
        seq: u64,
        attempt: u32,
        details: ErrorDetails,
    },
    TimerSchedule {
        instance: String,
        seq: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        seq: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        /// Unique per raise call, stamped by the client
        raise_id: String,
        name: String,
        payload: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::TerminateInstance { instance, .. } => instance,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    Orchestrator,
    Worker,
    Timer,
}

/// Identity and input of an instance, written once by `create_instance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance: String,
    pub orchestration: String,
    /// Pinned orchestration version; `None` resolves through the registry policy.
    pub version: Option<String>,
    pub input: String,
    pub created_at_ms: u64,
}

/// Snapshot returned by [`HistoryStore::load`]. `version` is the number of persisted events.
#[derive(Debug, Clone)]
pub struct LoadedHistory {
    pub record: InstanceRecord,
    pub history: Vec<Event>,
    pub version: u64,
}

/// All visible orchestrator-queue messages of one instance, taken under its lease.
#[derive(Debug, Clone)]
pub struct OrchestrationBatch {
    pub instance: String,
    pub lock_token: String,
    pub messages: Vec<WorkItem>,
}

/// Storage abstraction: append-only history per instance plus the three work queues.
///
/// Implementations must make `append_if_version` atomic: either every event and every
/// outbox item is stored, or nothing is.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Register a new instance and enqueue its `StartOrchestration` message.
    /// Fails if the instance already exists.
    async fn create_instance(&self, record: InstanceRecord) -> Result<(), ProviderError>;

    /// Read an instance's record and full history. `Ok(None)` if it does not exist.
    async fn load(&self, instance: &str) -> Result<Option<LoadedHistory>, ProviderError>;

    /// Append `new_events` if the history still has `expected_version` events, and enqueue
    /// `outbox` in the same step. Returns the new version, or a
    /// [`ProviderErrorKind::VersionConflict`] error if another writer got there first.
    async fn append_if_version(
        &self,
        instance: &str,
        expected_version: u64,
        new_events: Vec<Event>,
        outbox: Vec<(QueueKind, WorkItem)>,
    ) -> Result<u64, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), ProviderError>;

    /// Visible, unlocked items of a queue in delivery order.
    async fn list_ready_work_items(&self, kind: QueueKind) -> Result<Vec<WorkItem>, ProviderError>;

    /// Lease the first instance with visible orchestrator messages and take all of them.
    /// Instances leased by someone else are skipped until the lease is released or expires.
    async fn fetch_orchestration_batch(
        &self,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<OrchestrationBatch>, ProviderError>;

    async fn renew_orchestration_lease(&self, lock_token: &str, lease: Duration) -> Result<(), ProviderError>;

    /// Drop the batch's messages and release the lease.
    async fn ack_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Put the batch's messages back at the front of the queue and release the lease.
    async fn abandon_orchestration_batch(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Peek-lock the next item of the worker or timer queue.
    async fn dequeue_work(&self, kind: QueueKind, lock: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    async fn renew_work_lock(&self, kind: QueueKind, lock_token: &str, lock: Duration) -> Result<(), ProviderError>;

    /// Remove a locked item and enqueue `completion` on the orchestrator queue in one step.
    async fn ack_work(
        &self,
        kind: QueueKind,
        lock_token: &str,
        completion: Option<WorkItem>,
    ) -> Result<(), ProviderError>;

    async fn abandon_work(&self, kind: QueueKind, lock_token: &str) -> Result<(), ProviderError>;
}

pub(crate) fn queue_name(kind: QueueKind) -> &'static str {
    match kind {
        QueueKind::Orchestrator => "orchestrator",
        QueueKind::Worker => "worker",
        QueueKind::Timer => "timer",
    }
}
