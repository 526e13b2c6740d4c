//! Runtime: the coordinator, activity workers and timer service around a history store.
use crate::providers::HistoryStore;
use crate::{ActivityContext, OrchestrationContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub mod observability;
pub mod registry;
pub mod replay_engine;
pub mod status;
mod dispatchers;
mod timers;

use async_trait::async_trait;
pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, RuntimeMetrics, init_logging};
pub use registry::{ActivityRegistry, OrchestrationRegistry, VersionPolicy};
pub use status::{OrchestrationState, OrchestrationStatus};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a dispatcher finds its queue empty.
    pub dispatcher_idle_sleep: Duration,
    /// Concurrent orchestration workers. Different instances activate in parallel; one
    /// instance is never activated twice at the same time.
    pub orchestration_concurrency: usize,
    /// Concurrent activity workers.
    pub worker_concurrency: usize,
    /// Lease taken on an instance while its batch is processed. Renewed in the background.
    pub orchestrator_lease_timeout: Duration,
    /// How long before expiry a lease or lock is renewed (only used for timeouts of 15s or more).
    pub lease_renewal_buffer: Duration,
    /// Peek-lock duration for activity and timer work items. Renewed while an activity runs.
    pub worker_lock_timeout: Duration,
    /// Attempts to re-run an activation after losing an `append_if_version` race before
    /// the batch is abandoned for redelivery.
    pub max_append_conflict_retries: u32,
    pub observability: ObservabilityConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            orchestrator_lease_timeout: Duration::from_secs(30),
            lease_renewal_buffer: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(60),
            max_append_conflict_retries: 5,
            observability: ObservabilityConfig::default(),
        }
    }
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The wait's timer fired before a matching event arrived.
    Timeout,
    Other(String),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for event"),
            WaitError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Function wrapper that implements `ActivityHandler`.
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

static RUNTIME_SEQ: AtomicU64 = AtomicU64::new(1);

/// In-process runtime that executes orchestrations, activities and timers and persists
/// history through a [`HistoryStore`].
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    orchestration_registry: OrchestrationRegistry,
    activity_registry: Arc<ActivityRegistry>,
    options: RuntimeOptions,
    metrics: Arc<RuntimeMetrics>,
    runtime_id: String,
    shutdown_flag: Arc<AtomicBool>,
}

impl Runtime {
    /// Start a new runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if options.observability.init_logging_on_start
            && let Err(e) = init_logging(&options.observability)
        {
            // A subscriber installed by the host or by another runtime is fine.
            tracing::debug!(target: "dureplay::runtime", error = %e, "logging already initialized");
        }

        let runtime_id = format!(
            "{:04x}{:04x}",
            std::process::id() & 0xffff,
            RUNTIME_SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff
        );
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            activity_registry,
            options,
            metrics: Arc::new(RuntimeMetrics::default()),
            runtime_id,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        });

        tracing::info!(
            target: "dureplay::runtime",
            runtime_id = %runtime.runtime_id,
            orchestration_concurrency = runtime.options.orchestration_concurrency,
            worker_concurrency = runtime.options.worker_concurrency,
            orchestrations = ?runtime.orchestration_registry.list_names(),
            activities = ?runtime.activity_registry.list_names(),
            "runtime starting"
        );

        let orch_handles = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.extend(orch_handles);

        let work_handles = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.extend(work_handles);

        let timer_handles = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.extend(timer_handles);

        runtime
    }

    pub fn orchestration_registry(&self) -> &OrchestrationRegistry {
        &self.orchestration_registry
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop all dispatchers. In-flight work that was not acknowledged is redelivered by
    /// the store once its lease or lock expires.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
            // Cancelled tasks resolve at their next await point.
            let _ = j.await;
        }
        tracing::info!(target: "dureplay::runtime", runtime_id = %self.runtime_id, "runtime stopped");
    }
}

/// Wall-clock milliseconds since the Unix epoch. Only the coordinator and the timer
/// service read the clock; orchestration code sees recorded timestamps.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
