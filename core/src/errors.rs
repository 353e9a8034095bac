/// Error types for the docflow workflow engine.
use thiserror::Error;

use crate::expression::EvalError;

/// Errors raised by a content store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    ItemExists(String),

    #[error("Concurrent modification of {0}, save rejected")]
    Conflict(String),

    #[error("Already locked: {0}")]
    AlreadyLocked(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Store invariant violated: {0}")]
    Invariant(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while loading a state-chart definition.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Failed to parse definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate state: {0}")]
    DuplicateState(String),

    #[error("Unknown state '{state}' referenced from {referenced_from}")]
    UnknownState {
        state: String,
        referenced_from: String,
    },

    #[error("Unknown action type '{0}'")]
    UnknownAction(String),

    #[error("Action '{action}' is missing required parameter '{param}'")]
    MissingParameter { action: String, param: String },

    #[error("Invalid value '{value}' for parameter '{param}' of action '{action}'")]
    InvalidParameter {
        action: String,
        param: String,
        value: String,
    },

    #[error("Invalid expression in {location}: {message}")]
    InvalidExpression { location: String, message: String },

    #[error("Invalid definition: {0}")]
    Invalid(String),

    #[error("Eventless transition in state '{0}' must not carry actions")]
    EventlessWithActions(String),

    #[error("Definition not found: {0}")]
    NotFound(String),
}

/// Result type for definition loading.
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Errors surfaced to callers of a workflow operation.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Operation '{operation}' is not allowed in state '{state}'{}", format_reasons(.reasons))]
    NotAllowed {
        operation: String,
        state: String,
        reasons: Vec<String>,
    },

    #[error("Expression evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    #[error("Task '{task}' failed: {reason}")]
    Task { task: String, reason: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid document model: {0}")]
    InvalidModel(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Routing did not settle: {0}")]
    Routing(String),

    #[error("Workflow definition error: {0}")]
    Definition(#[from] DefinitionError),
}

fn format_reasons(reasons: &[String]) -> String {
    if reasons.is_empty() {
        String::new()
    } else {
        format!(": {}", reasons.join("; "))
    }
}

impl WorkflowError {
    /// Build a task failure from any displayable cause.
    pub fn task(task: &str, reason: impl std::fmt::Display) -> Self {
        WorkflowError::Task {
            task: task.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for workflow operations.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Errors inside the cluster task queue runner.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Malformed task descriptor at {path}: {reason}")]
    MalformedDescriptor { path: String, reason: String },

    #[error("Worker stopped")]
    WorkerStopped,
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_allowed_lists_reasons() {
        let err = WorkflowError::NotAllowed {
            operation: "unlock".to_string(),
            state: "editing".to_string(),
            reasons: vec!["draft is not held by the invoking user".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Operation 'unlock' is not allowed in state 'editing': draft is not held by the invoking user"
        );
    }

    #[test]
    fn test_not_allowed_without_reasons() {
        let err = WorkflowError::NotAllowed {
            operation: "publish".to_string(),
            state: "live".to_string(),
            reasons: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Operation 'publish' is not allowed in state 'live'"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let err: WorkflowError = StoreError::Conflict("/content/doc".to_string()).into();
        assert!(matches!(err, WorkflowError::Store(StoreError::Conflict(_))));
    }
}
