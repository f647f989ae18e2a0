use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type shared by every Conductor crate.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// A request was missing a required field or carried an invalid value.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No agent registered under this name.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Neither the poller nor the orchestrator knows this task.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// An agent with the same name but a different descriptor is already registered.
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(String),

    /// No healthy agent meets the task's requirements.
    #[error("No suitable agent for task {0}")]
    NoSuitableAgent(Uuid),

    /// The target agent exists but is not healthy.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Every eligible worker stayed busy for the whole wait.
    #[error("No worker available for subtask '{subtask}' after {attempts} attempts")]
    NoWorkerAvailable {
        /// Subtask that could not be placed.
        subtask: String,
        /// Claim attempts made.
        attempts: u32,
    },

    /// A subtask was reached before all of its dependencies succeeded.
    #[error("Dependencies not met for subtask '{subtask}': missing {missing:?}")]
    DependencyNotMet {
        /// Blocked subtask.
        subtask: String,
        /// Dependencies that have not succeeded.
        missing: Vec<String>,
    },

    /// The execution plan does not match the subtasks.
    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),

    /// The orchestration for this task was cancelled.
    #[error("Task cancelled: {0}")]
    Cancelled(Uuid),

    /// Splitting a compound task failed.
    #[error("Decomposition failed: {0}")]
    DecompositionFailed(#[source] Box<ConductorError>),

    /// Merging subtask results failed.
    #[error("Aggregation failed: {0}")]
    AggregationFailed(#[source] Box<ConductorError>),

    /// An error returned by the text-generation provider.
    #[error("Provider error: {0}")]
    Provider(String),

    /// An error reported by an agent while processing a task.
    #[error("Agent error: {0}")]
    Agent(String),

    /// Transport failure talking to a remote agent or endpoint.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Gateway failed to serve a request.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// The receiving end of an event subscription has gone away.
    #[error("Subscriber closed")]
    SubscriberClosed,

    /// Malformed JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used for HTTP mapping and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error, never retried.
    Validation,
    /// Unknown agent or task, never retried.
    NotFound,
    /// Temporarily unavailable resource; safe to retry.
    Unavailable,
    /// Fatal to the current run (dependency violation, bad plan).
    Fatal,
    /// Upstream provider or agent failure; retried up to a bound.
    Provider,
    /// Anything else.
    Internal,
}

impl ConductorError {
    /// Classify for HTTP status and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::Validation(_) | ConductorError::DuplicateAgent(_) => {
                ErrorKind::Validation
            }
            ConductorError::AgentNotFound(_) | ConductorError::TaskNotFound(_) => {
                ErrorKind::NotFound
            }
            ConductorError::AgentUnavailable(_)
            | ConductorError::NoWorkerAvailable { .. }
            | ConductorError::NoSuitableAgent(_) => ErrorKind::Unavailable,
            ConductorError::DependencyNotMet { .. }
            | ConductorError::InvalidPlan(_)
            | ConductorError::Cancelled(_) => ErrorKind::Fatal,
            ConductorError::Provider(_)
            | ConductorError::Agent(_)
            | ConductorError::Http(_)
            | ConductorError::DecompositionFailed(_)
            | ConductorError::AggregationFailed(_) => ErrorKind::Provider,
            ConductorError::Config(_)
            | ConductorError::Gateway(_)
            | ConductorError::SubscriberClosed
            | ConductorError::Json(_)
            | ConductorError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable | ErrorKind::Provider)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_classification() {
        assert_eq!(
            ConductorError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ConductorError::AgentNotFound("a".into()).kind(),
            ErrorKind::NotFound
        );
        assert!(ConductorError::AgentUnavailable("a".into()).is_retryable());
        assert!(ConductorError::Provider("timeout".into()).is_retryable());
        assert!(!ConductorError::DependencyNotMet {
            subtask: "s2".into(),
            missing: vec!["s1".into()],
        }
        .is_retryable());
    }

    #[test]
    fn test_wrapped_source_is_kept() {
        let err = ConductorError::DecompositionFailed(Box::new(ConductorError::Provider(
            "rate limited".into(),
        )));
        assert!(err.to_string().contains("rate limited"));
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "Provider error: rate limited");
    }
}
