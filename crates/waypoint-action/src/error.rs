//! Error types for the action pipeline.

use uuid::Uuid;
use waypoint_core::error::WaypointError;

/// Errors from action execution.
///
/// Prevention and validation failures are not errors; they are reported
/// through `ActionStatus`. These variants surface only when the handler is
/// configured with the `throw` strategy or when a collaborator fails.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action handler failed: {0}")]
    HandlerFailed(String),
    #[error("Action type not registered: {0}")]
    UnregisteredAction(String),
    #[error("Interceptor '{name}' failed: {reason}")]
    InterceptorFailed { name: String, reason: String },
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),
    #[error("Action execution timed out after {0} ms")]
    Timeout(u64),
    #[error("Context error: {0}")]
    Context(#[from] ContextError),
    #[error("Action handler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Core(#[from] WaypointError),
}

/// Errors from context preservation and lookup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("Context validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Context too large: {size} bytes exceeds {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Context not found: {0}")]
    NotFound(Uuid),
    #[error("Context serialization failed: {0}")]
    Serialization(String),
}

/// Errors from resource tracking.
///
/// These never escape the bulk cleanup methods; they are collected into
/// per-resource outcomes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CleanupError {
    #[error("Cleanup task failed: {0}")]
    TaskFailed(String),
    #[error("Resource not tracked: {0}")]
    NotTracked(Uuid),
    #[error("Cleanup manager is shut down")]
    ShutDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_display() {
        let err = ActionError::HandlerFailed("connection reset".to_string());
        assert_eq!(err.to_string(), "Action handler failed: connection reset");

        let err = ActionError::UnregisteredAction("bookmark".to_string());
        assert_eq!(err.to_string(), "Action type not registered: bookmark");

        let err = ActionError::InterceptorFailed {
            name: "audit".to_string(),
            reason: "panic".to_string(),
        };
        assert_eq!(err.to_string(), "Interceptor 'audit' failed: panic");

        let err = ActionError::Timeout(1500);
        assert_eq!(err.to_string(), "Action execution timed out after 1500 ms");
    }

    #[test]
    fn test_context_error_display() {
        let err = ContextError::Validation(vec![
            "query is required".to_string(),
            "timestamp must be a number".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Context validation failed: query is required; timestamp must be a number"
        );

        let err = ContextError::TooLarge {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "Context too large: 2048 bytes exceeds 1024 bytes"
        );
    }

    #[test]
    fn test_action_error_from_context_error() {
        let err: ActionError = ContextError::NotFound(Uuid::nil()).into();
        assert!(matches!(err, ActionError::Context(ContextError::NotFound(_))));
        assert!(err.to_string().contains("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn test_action_error_from_core_error() {
        let err: ActionError = WaypointError::ShuttingDown.into();
        assert!(matches!(err, ActionError::Core(_)));
        assert_eq!(err.to_string(), "Shutdown in progress");
    }

    #[test]
    fn test_cleanup_error_display() {
        let err = CleanupError::TaskFailed("listener already detached".to_string());
        assert_eq!(
            err.to_string(),
            "Cleanup task failed: listener already detached"
        );
        assert_eq!(CleanupError::ShutDown.to_string(), "Cleanup manager is shut down");
    }
}
