//! Callback execution for the default action path.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use waypoint_core::config::HandlerConfig;
use waypoint_core::types::SearchResult;

use crate::error::ActionError;
use crate::types::{ActionCallback, SecureActionContext};

/// Invokes caller-supplied callbacks.
#[async_trait]
pub trait CallbackExecutor: Send + Sync {
    async fn execute(
        &self,
        callback: ActionCallback,
        result: SearchResult,
        context: SecureActionContext,
    ) -> Result<Value, ActionError>;
}

/// Runs callbacks inline, optionally bounded by a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimedCallbackExecutor {
    timeout: Option<Duration>,
}

impl TimedCallbackExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &HandlerConfig) -> Self {
        Self::new(config.timeout_ms.map(Duration::from_millis))
    }
}

#[async_trait]
impl CallbackExecutor for TimedCallbackExecutor {
    async fn execute(
        &self,
        callback: ActionCallback,
        result: SearchResult,
        context: SecureActionContext,
    ) -> Result<Value, ActionError> {
        let result_id = result.id.clone();
        let fut = callback(result, context);
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let ms = limit.as_millis() as u64;
                    warn!(result_id = %result_id, timeout_ms = ms, "Action callback timed out");
                    return Err(ActionError::Timeout(ms));
                }
            },
            None => fut.await,
        };
        outcome.map_err(ActionError::HandlerFailed)
    }
}
