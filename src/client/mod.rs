use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{HistoryStore, InstanceRecord, ProviderError, QueueKind, WorkItem};
use crate::runtime::{OrchestrationState, OrchestrationStatus, now_ms};
use crate::Event;
use serde::{Serialize, de::DeserializeOwned};

/// Errors returned by [`Client`] operations.
#[derive(Debug)]
pub enum ClientError {
    Provider(ProviderError),
    /// No instance with this id exists
    NotFound(String),
    /// Payload could not be encoded or decoded
    Codec(String),
    /// `wait_for_completion` gave up before the instance finished
    Timeout { instance: String },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "provider error: {e}"),
            ClientError::NotFound(instance) => write!(f, "instance not found: {instance}"),
            ClientError::Codec(msg) => write!(f, "codec error: {msg}"),
            ClientError::Timeout { instance } => write!(f, "timed out waiting for {instance}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

static GENERATED_IDS: AtomicU64 = AtomicU64::new(1);

/// Process-unique id: clock, pid and a counter, so concurrent clients do not collide.
fn generate_id(prefix: &str) -> String {
    format!(
        "{prefix}-{:x}-{:x}-{}",
        now_ms(),
        std::process::id(),
        GENERATED_IDS.fetch_add(1, Ordering::Relaxed)
    )
}

/// Control-plane client.
///
/// The client never talks to a running [`Runtime`](crate::Runtime) directly: every
/// operation goes through the shared [`HistoryStore`], so clients and runtimes can live
/// in different processes as long as they share a store.
pub struct Client {
    store: Arc<dyn HistoryStore>,
}

impl Client {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Create an instance of `orchestration` and enqueue its start.
    ///
    /// An empty `instance_id` generates one. Returns the instance id.
    pub async fn schedule_new_orchestration(
        &self,
        orchestration: &str,
        instance_id: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.create(orchestration, None, instance_id, input.into()).await
    }

    /// Like [`schedule_new_orchestration`](Self::schedule_new_orchestration), pinned to `version`.
    pub async fn schedule_new_orchestration_versioned(
        &self,
        orchestration: &str,
        version: impl Into<String>,
        instance_id: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        self.create(orchestration, Some(version.into()), instance_id, input.into())
            .await
    }

    pub async fn schedule_new_orchestration_typed<In: Serialize>(
        &self,
        orchestration: &str,
        instance_id: &str,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.create(orchestration, None, instance_id, payload).await
    }

    async fn create(
        &self,
        orchestration: &str,
        version: Option<String>,
        instance_id: &str,
        input: String,
    ) -> Result<String, ClientError> {
        let instance = if instance_id.is_empty() {
            generate_id(orchestration)
        } else {
            instance_id.to_string()
        };
        self.store
            .create_instance(InstanceRecord {
                instance: instance.clone(),
                orchestration: orchestration.to_string(),
                version,
                input,
                created_at_ms: now_ms(),
            })
            .await?;
        tracing::debug!(target: "dureplay::client", instance_id = %instance, orchestration, "instance scheduled");
        Ok(instance)
    }

    /// Deliver an external event. The event is recorded even if nothing waits for it yet.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: &str,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    raise_id: generate_id("raise"),
                    name: event_name.to_string(),
                    payload: payload.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn raise_event_typed<T: Serialize>(
        &self,
        instance: &str,
        event_name: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(payload).map_err(ClientError::Codec)?;
        self.raise_event(instance, event_name, payload).await
    }

    /// Request termination. Work that arrives afterwards is discarded.
    pub async fn terminate(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.ensure_exists(instance).await?;
        self.store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
            )
            .await?;
        Ok(())
    }

    async fn ensure_exists(&self, instance: &str) -> Result<(), ClientError> {
        match self.store.load(instance).await? {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(instance.to_string())),
        }
    }

    pub async fn fetch_status(&self, instance: &str) -> Result<OrchestrationState, ClientError> {
        match self.store.load(instance).await? {
            Some(loaded) => Ok(OrchestrationState::from_history(&loaded.record, &loaded.history)),
            None => Err(ClientError::NotFound(instance.to_string())),
        }
    }

    /// Poll until the instance reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_completion(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationState, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let state = self.fetch_status(instance).await?;
            if state.status.is_terminal() {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }

    /// Wait and decode the output. The inner `Err` is the failure or termination message.
    pub async fn wait_for_completion_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<Result<Out, String>, ClientError> {
        let state = self.wait_for_completion(instance, timeout).await?;
        let output = state.output.unwrap_or_default();
        match state.status {
            OrchestrationStatus::Completed => Json::decode::<Out>(&output).map(Ok).map_err(ClientError::Codec),
            _ => Ok(Err(output)),
        }
    }

    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        match self.store.load(instance).await? {
            Some(loaded) => Ok(loaded.history),
            None => Err(ClientError::NotFound(instance.to_string())),
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }
}
