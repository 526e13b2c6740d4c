/// How the runtime should react to a [`ProviderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient: busy storage, I/O hiccup. Retry the operation.
    Retryable,
    /// Will not succeed on retry: missing instance, invalid token, corrupt data.
    Permanent,
    /// `append_if_version` lost an optimistic-concurrency race.
    VersionConflict,
}

/// Provider-specific error with retry classification.
///
/// A version conflict is never merged by the store; the coordinator discards the
/// activation that produced the rejected delta and replays it from a fresh load.
///
/// ```rust
/// use dureplay::providers::ProviderError;
///
/// let err = ProviderError::version_conflict("append_if_version", "inst-1", 4, 5);
/// assert!(err.is_version_conflict());
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g. "append_if_version", "fetch_orchestration_batch")
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Retryable,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Permanent,
        }
    }

    pub fn version_conflict(operation: impl Into<String>, instance: &str, expected: u64, actual: u64) -> Self {
        Self {
            operation: operation.into(),
            message: format!("version conflict on {instance}: expected {expected}, found {actual}"),
            kind: ProviderErrorKind::VersionConflict,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_version_conflict(&self) -> bool {
        self.kind == ProviderErrorKind::VersionConflict
    }

    /// Failure recorded on an instance whose progress the store keeps rejecting.
    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::retryable("io", e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::permanent("serde", e.to_string())
    }
}
