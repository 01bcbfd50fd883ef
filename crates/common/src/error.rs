//! Error taxonomy for the orchestrator core (§7).

use thiserror::Error;

/// Main error type threaded through every component.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// Planner output failed schema validation after retries.
    #[error("planner output failed schema validation: {0}")]
    SchemaInvalid(String),

    /// A `TodoItem.dependencies` edge points at an id that does not exist
    /// in the same `TodoList`.
    #[error("unknown dependency {dependency} referenced by task {task_id}")]
    UnknownDependency { task_id: String, dependency: String },

    /// The item graph of a `TodoList` contains a cycle.
    #[error("dependency cycle detected involving task {0}")]
    DependencyCycle(String),

    /// Surfaces only after a provider 429 has exhausted router retries;
    /// in all other cases this is handled internally by the router.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Content blocked by a provider safety filter; may surface after the
    /// router's escalation ladder and sanitization retry are exhausted.
    #[error("safety filter blocked request: {0}")]
    SafetyBlocked(String),

    /// No key had capacity after both fallback passes.
    #[error("all keys exhausted")]
    AllKeysExhausted,

    /// `SecretStore::fetch` failed for a selected key; the key is cooled
    /// down and the caller moves to the next candidate.
    #[error("failed to fetch secret for key {0}: {1}")]
    SecretFetchError(String, String),

    /// Coder's static checks rejected generated code.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// A classified test failure, handled by Debugger/IterativeLoop.
    #[error("test failure ({kind}): {message}")]
    TestFailure { kind: String, message: String },

    /// The repair budget (`max_branch_depth`/`max_debug_attempts`) was
    /// spent; the task becomes terminally Failed.
    #[error("branch budget exceeded for task {0}")]
    BranchBudgetExceeded(String),

    /// Dispatch-level failures.
    #[error("task {0} timed out")]
    TaskTimeout(String),
    #[error("internal error executing task {0}: {1}")]
    TaskInternalError(String, String),

    /// Generic agent/orchestration failures without a more specific
    /// taxonomy entry.
    #[error("agent error: {0}")]
    Agent(String),
    #[error("orchestration error: {0}")]
    Orchestration(String),

    /// Ambient errors.
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the router/orchestrator should retry on this error without
    /// surfacing it to the user.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::RateLimited(_)
                | Error::TaskTimeout(_)
                | Error::Redis(_)
        )
    }

    /// Severity bucket for metrics/logging.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) | Error::AllKeysExhausted | Error::DependencyCycle(_) => ErrorSeverity::Critical,
            Error::Agent(_) | Error::Orchestration(_) | Error::BranchBudgetExceeded(_) | Error::TaskInternalError(..) => {
                ErrorSeverity::High
            }
            Error::Timeout(_) | Error::RateLimited(_) | Error::TaskTimeout(_) | Error::TestFailure { .. } => {
                ErrorSeverity::Medium
            }
            Error::Validation(_) | Error::ValidationFailed(_) | Error::SchemaInvalid(_) => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels, surfaced on the `polyagent_errors_total` metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}
