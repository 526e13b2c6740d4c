use crate::providers::InstanceRecord;
use crate::{ErrorDetails, Event, EventKind};

/// Lifecycle status of an instance, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// Created, no activation has run yet
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed | OrchestrationStatus::Terminated
        )
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrchestrationStatus::Pending => "Pending",
            OrchestrationStatus::Running => "Running",
            OrchestrationStatus::Completed => "Completed",
            OrchestrationStatus::Failed => "Failed",
            OrchestrationStatus::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an instance as returned by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationState {
    pub instance: String,
    pub name: String,
    pub status: OrchestrationStatus,
    /// Result for Completed, error message for Failed, reason for Terminated
    pub output: Option<String>,
    pub failure: Option<ErrorDetails>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
}

impl OrchestrationState {
    pub fn from_history(record: &InstanceRecord, history: &[Event]) -> Self {
        let mut state = Self {
            instance: record.instance.clone(),
            name: record.orchestration.clone(),
            status: if history.is_empty() {
                OrchestrationStatus::Pending
            } else {
                OrchestrationStatus::Running
            },
            output: None,
            failure: None,
            created_at_ms: record.created_at_ms,
            completed_at_ms: None,
        };

        if let Some(last) = history.iter().rev().find(|e| e.is_terminal()) {
            state.completed_at_ms = Some(last.timestamp_ms);
            match &last.kind {
                EventKind::ExecutionCompleted { result: Ok(output) } => {
                    state.status = OrchestrationStatus::Completed;
                    state.output = Some(output.clone());
                }
                EventKind::ExecutionCompleted { result: Err(details) } => {
                    state.status = OrchestrationStatus::Failed;
                    state.output = Some(details.display_message());
                    state.failure = Some(details.clone());
                }
                EventKind::ExecutionTerminated { reason } => {
                    state.status = OrchestrationStatus::Terminated;
                    state.output = Some(reason.clone());
                }
                _ => {}
            }
        }
        state
    }
}
