//! Structured logging setup and in-process runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module [instance_id] message
    #[default]
    Compact,
}

/// Logging configuration carried by [`RuntimeOptions`](super::RuntimeOptions).
///
/// ```rust,no_run
/// # use dureplay::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// dureplay::runtime::init_logging(&config).ok();
/// ```
///
/// Runtime logs carry `instance_id`, `worker_id`, `seq` and `attempt` fields where they
/// apply, so one instance can be followed across dispatchers.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level for orchestration and activity user logs (e.g., "info", "debug")
    pub log_level: String,
    /// Level for the runtime's own logs
    pub runtime_log_level: String,
    /// Install a global subscriber when the runtime starts
    pub init_logging_on_start: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            runtime_log_level: "warn".to_string(),
            init_logging_on_start: false,
        }
    }
}

fn default_filter_expression(config: &ObservabilityConfig) -> String {
    format!(
        "warn,dureplay::runtime={},dureplay::orchestration={lvl},dureplay::activity={lvl}",
        config.runtime_log_level,
        lvl = config.log_level
    )
}

/// Install a global `tracing` subscriber. `RUST_LOG` overrides the configured levels.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(config)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}

/// Snapshot of the runtime counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub activations: u64,
    pub version_conflicts: u64,
    pub orch_completions: u64,
    pub orch_failures: u64,
    pub orch_terminations: u64,
    pub nondeterminism_failures: u64,
    pub infrastructure_failures: u64,
    pub activity_success: u64,
    pub activity_app_errors: u64,
    pub activity_config_errors: u64,
    pub retries_scheduled: u64,
}

/// Lock-free counters updated by the dispatchers.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    activations: AtomicU64,
    version_conflicts: AtomicU64,
    orch_completions: AtomicU64,
    orch_failures: AtomicU64,
    orch_terminations: AtomicU64,
    nondeterminism_failures: AtomicU64,
    infrastructure_failures: AtomicU64,
    activity_success: AtomicU64,
    activity_app_errors: AtomicU64,
    activity_config_errors: AtomicU64,
    retries_scheduled: AtomicU64,
}

impl RuntimeMetrics {
    #[inline]
    pub fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_version_conflict(&self) {
        self.version_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orchestration_completion(&self) {
        self.orch_completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orchestration_failure(&self, details: &crate::ErrorDetails) {
        self.orch_failures.fetch_add(1, Ordering::Relaxed);
        if matches!(
            details,
            crate::ErrorDetails::Configuration {
                kind: crate::ConfigErrorKind::Nondeterminism,
                ..
            }
        ) {
            self.nondeterminism_failures.fetch_add(1, Ordering::Relaxed);
        }
        if matches!(details, crate::ErrorDetails::Infrastructure { .. }) {
            self.infrastructure_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_orchestration_termination(&self) {
        self.orch_terminations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_activity_success(&self) {
        self.activity_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity_failure(&self, details: &crate::ErrorDetails) {
        if details.is_configuration() {
            self.activity_config_errors.fetch_add(1, Ordering::Relaxed);
        } else {
            self.activity_app_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retries_scheduled(&self, count: u64) {
        self.retries_scheduled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            activations: self.activations.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            orch_completions: self.orch_completions.load(Ordering::Relaxed),
            orch_failures: self.orch_failures.load(Ordering::Relaxed),
            orch_terminations: self.orch_terminations.load(Ordering::Relaxed),
            nondeterminism_failures: self.nondeterminism_failures.load(Ordering::Relaxed),
            infrastructure_failures: self.infrastructure_failures.load(Ordering::Relaxed),
            activity_success: self.activity_success.load(Ordering::Relaxed),
            activity_app_errors: self.activity_app_errors.load(Ordering::Relaxed),
            activity_config_errors: self.activity_config_errors.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
        }
    }
}
