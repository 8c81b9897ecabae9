//! Core types and value objects for the action pipeline.
//!
//! Defines action contexts and their secured form, interception and
//! execution results, per-action options, and statistics snapshots.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use waypoint_core::config::ContextConfig;
use waypoint_core::types::{NavigationTarget, SearchResult, Timestamp};

use crate::error::{ActionError, ContextError};

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A zero-argument task that runs only when awaited.
pub struct DeferredAction(BoxFuture<'static, Result<(), ActionError>>);

impl DeferredAction {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        Self(Box::pin(fut))
    }

    pub async fn run(self) -> Result<(), ActionError> {
        self.0.await
    }
}

impl fmt::Debug for DeferredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeferredAction(..)")
    }
}

/// Caller-supplied callback run on the default execution path.
pub type ActionCallback =
    Arc<dyn Fn(SearchResult, SecureActionContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Wrap an async closure as an [`ActionCallback`].
pub fn action_callback<F, Fut>(f: F) -> ActionCallback
where
    F: Fn(SearchResult, SecureActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
{
    Arc::new(move |result, context| Box::pin(f(result, context)))
}

// =============================================================================
// Action Context
// =============================================================================

/// Where the action originated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceInfo {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceInfo {
    pub fn new(source_type: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            id: None,
            name: None,
            version: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl Default for SourceInfo {
    fn default() -> Self {
        Self::new("search")
    }
}

/// The search that produced the selected result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInfo {
    pub total_results: u64,
    /// Backend processing time in milliseconds.
    pub processing_time: f64,
    pub result_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Map<String, Value>>,
}

/// Timing captured while the context was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub context_creation_us: u64,
    pub search_processing_time_ms: f64,
}

/// The user on whose behalf the action runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl UserInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            permissions: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = Some(permissions.into_iter().map(Into::into).collect());
        self
    }
}

/// Provenance snapshot describing why an action is happening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub query: String,
    pub timestamp: Timestamp,
    pub source: SourceInfo,
    pub search: SearchInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Map<String, Value>>,
}

/// Outcome of validating a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub is_valid: bool,
    pub sanitized: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Trust decision attached to a secured context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRecord {
    pub trusted: bool,
    pub origin: String,
    pub permissions: Vec<String>,
    pub restrictions: Vec<String>,
}

/// Audit trail of a secured context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub context_id: Uuid,
    pub created_by: String,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<Timestamp>,
    /// Lifecycle tags in the order they happened.
    pub chain: Vec<String>,
}

/// An action context plus validation, security and audit annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureActionContext {
    #[serde(flatten)]
    pub context: ActionContext,
    pub validation: ValidationRecord,
    pub security: SecurityRecord,
    pub audit: AuditRecord,
}

impl SecureActionContext {
    pub fn context_id(&self) -> Uuid {
        self.audit.context_id
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.security.permissions.iter().any(|p| p == permission)
    }

    pub fn is_restricted(&self, restriction: &str) -> bool {
        self.security.restrictions.iter().any(|r| r == restriction)
    }
}

// =============================================================================
// Preservation
// =============================================================================

/// Per-call toggles for `preserve_context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreserveOptions {
    pub validate: bool,
    pub sanitize: bool,
    pub secure: bool,
    pub track: bool,
    pub calculate_size: bool,
    /// Overrides the configured origin for this context.
    pub origin: Option<String>,
}

impl Default for PreserveOptions {
    fn default() -> Self {
        Self {
            validate: true,
            sanitize: true,
            secure: true,
            track: true,
            calculate_size: true,
            origin: None,
        }
    }
}

impl PreserveOptions {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            validate: config.validate,
            sanitize: config.sanitize,
            secure: config.secure,
            track: config.track,
            calculate_size: config.calculate_size,
            origin: None,
        }
    }
}

/// Which optional sections `create_context` folds in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentConfig {
    pub include_performance: bool,
    pub include_user: bool,
    pub include_source_details: bool,
    pub user: Option<UserInfo>,
    /// Extra entries merged into the context's custom map.
    pub custom: Option<Map<String, Value>>,
}

impl EnrichmentConfig {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            include_performance: config.include_performance,
            include_user: config.include_user,
            include_source_details: config.include_source_details,
            user: None,
            custom: None,
        }
    }
}

/// Result of `preserve_context`. Never an `Err`; failures populate `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextPreservationResult {
    pub success: bool,
    pub context: Option<SecureActionContext>,
    pub error: Option<ContextError>,
    pub warnings: Vec<String>,
    pub size_bytes: usize,
    /// `true` when the size came from the approximate fallback.
    pub size_estimated: bool,
    pub processing_time_ms: f64,
}

/// Field updates applied by `update_context`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub query: Option<String>,
    pub user: Option<UserInfo>,
    pub performance: Option<PerformanceMetrics>,
    /// Merged key by key into the custom map.
    pub custom: Option<Map<String, Value>>,
}

// =============================================================================
// Interception
// =============================================================================

/// What a single interceptor asks of the pipeline.
#[derive(Debug, Default)]
pub struct InterceptionResult {
    pub prevent_default: bool,
    pub stop_processing: bool,
    pub custom_action: Option<DeferredAction>,
    pub reason: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl InterceptionResult {
    /// Let the action continue.
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Veto the action.
    pub fn prevent(reason: impl Into<String>) -> Self {
        Self {
            prevent_default: true,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Skip the remaining interceptors.
    pub fn stop(mut self) -> Self {
        self.stop_processing = true;
        self
    }

    pub fn with_custom_action(mut self, action: DeferredAction) -> Self {
        self.custom_action = Some(action);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Aggregate of one pass through the prevention policy and interceptor chain.
#[derive(Debug, Default)]
pub struct InterceptionOutcome {
    pub prevented: bool,
    pub reason: Option<String>,
    pub custom_action: Option<DeferredAction>,
    /// The action should be executed through the navigation pipeline.
    pub custom_navigation: bool,
    pub interceptors_run: usize,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
}

/// Options for `handle_navigation`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationOptions {
    /// Explicit URL; falls back to the result's URL.
    pub url: Option<String>,
    /// Falls back to the configured default target.
    pub target: Option<NavigationTarget>,
}

/// A navigation that was performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationRecord {
    pub url: String,
    pub target: NavigationTarget,
    pub custom_handler: bool,
}

// =============================================================================
// Execution
// =============================================================================

/// Tagged outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// The action ran to completion.
    Completed,
    /// A policy, interceptor or navigation stage vetoed the action.
    Prevented,
    /// Nothing ran, e.g. the action type was not registered.
    NotExecuted,
    /// Context creation or execution failed.
    Failed,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Completed => write!(f, "completed"),
            ActionStatus::Prevented => write!(f, "prevented"),
            ActionStatus::NotExecuted => write!(f, "not_executed"),
            ActionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result returned for every processed action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionExecutionResult {
    pub status: ActionStatus,
    pub action_id: Option<Uuid>,
    pub context_id: Option<Uuid>,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub navigation: Option<NavigationRecord>,
    pub output: Option<Value>,
    pub metadata: Map<String, Value>,
    pub processing_time_ms: f64,
}

impl ActionExecutionResult {
    fn with_status(status: ActionStatus) -> Self {
        Self {
            status,
            action_id: None,
            context_id: None,
            reason: None,
            error: None,
            navigation: None,
            output: None,
            metadata: Map::new(),
            processing_time_ms: 0.0,
        }
    }

    pub fn completed() -> Self {
        Self::with_status(ActionStatus::Completed)
    }

    pub fn prevented(reason: impl Into<String>) -> Self {
        let mut result = Self::with_status(ActionStatus::Prevented);
        result.reason = Some(reason.into());
        result
    }

    pub fn not_executed(reason: impl Into<String>) -> Self {
        let mut result = Self::with_status(ActionStatus::NotExecuted);
        result.reason = Some(reason.into());
        result
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut result = Self::with_status(ActionStatus::Failed);
        result.error = Some(error.into());
        result
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Completed
    }

    pub fn is_prevented(&self) -> bool {
        self.status == ActionStatus::Prevented
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_navigation(mut self, navigation: NavigationRecord) -> Self {
        self.navigation = Some(navigation);
        self
    }

    pub fn with_context_id(mut self, context_id: Uuid) -> Self {
        self.context_id = Some(context_id);
        self
    }
}

/// Per-invocation options for `process_action`.
#[derive(Default)]
pub struct ActionOptions {
    pub query: String,
    pub source: Option<SourceInfo>,
    pub user: Option<UserInfo>,
    pub custom: Option<Map<String, Value>>,
    pub navigation: NavigationOptions,
    pub custom_action: Option<DeferredAction>,
    pub callback: Option<ActionCallback>,
}

impl ActionOptions {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: SourceInfo) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.navigation.url = Some(url.into());
        self
    }

    pub fn with_target(mut self, target: NavigationTarget) -> Self {
        self.navigation.target = Some(target);
        self
    }

    pub fn with_custom_action(mut self, action: DeferredAction) -> Self {
        self.custom_action = Some(action);
        self
    }

    pub fn with_callback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SearchResult, SecureActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.callback = Some(action_callback(f));
        self
    }
}

impl fmt::Debug for ActionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionOptions")
            .field("query", &self.query)
            .field("source", &self.source)
            .field("user", &self.user)
            .field("navigation", &self.navigation)
            .field("custom_action", &self.custom_action.is_some())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters kept by the interceptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterceptorStatistics {
    pub total_interceptions: u64,
    pub prevented_actions: u64,
    pub custom_navigations: u64,
    pub executed_actions: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
}

/// Counters kept by the action handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionStatistics {
    pub total_actions: u64,
    pub successful_actions: u64,
    pub failed_actions: u64,
    pub prevented_actions: u64,
    pub total_processing_time_ms: f64,
    pub average_processing_time_ms: f64,
    pub active_actions: usize,
    pub peak_concurrency: usize,
    pub last_action_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> ActionContext {
        ActionContext {
            query: "rust async".to_string(),
            timestamp: Timestamp(1_700_000_000_000),
            source: SourceInfo::new("search").with_name("docs"),
            search: SearchInfo {
                total_results: 42,
                processing_time: 12.5,
                result_index: 3,
                page: None,
                filters: None,
            },
            performance: None,
            user: None,
            custom: None,
        }
    }

    #[test]
    fn test_context_serializes_camel_case() {
        let json = serde_json::to_value(sample_context()).unwrap();
        assert_eq!(json["source"]["type"], "search");
        assert_eq!(json["search"]["totalResults"], 42);
        assert_eq!(json["search"]["resultIndex"], 3);
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert!(json.get("user").is_none());
    }

    #[test]
    fn test_secure_context_flattens_base_fields() {
        let secure = SecureActionContext {
            context: sample_context(),
            validation: ValidationRecord::default(),
            security: SecurityRecord {
                trusted: true,
                origin: "app://local".to_string(),
                permissions: vec!["navigate".to_string()],
                restrictions: vec!["no-user-context".to_string()],
            },
            audit: AuditRecord {
                context_id: Uuid::new_v4(),
                created_by: "action-handler".to_string(),
                created_at: Timestamp::now(),
                modified_by: None,
                modified_at: None,
                chain: vec!["created".to_string()],
            },
        };
        let json = serde_json::to_value(&secure).unwrap();
        assert_eq!(json["query"], "rust async");
        assert_eq!(json["audit"]["createdBy"], "action-handler");
        assert!(secure.has_permission("navigate"));
        assert!(secure.is_restricted("no-user-context"));
        assert!(!secure.is_restricted("untrusted-origin"));
    }

    #[test]
    fn test_interception_result_builders() {
        let r = InterceptionResult::proceed();
        assert!(!r.prevent_default);
        assert!(!r.stop_processing);

        let r = InterceptionResult::prevent("blocked")
            .stop()
            .with_metadata("rule", serde_json::json!("adult-content"));
        assert!(r.prevent_default);
        assert!(r.stop_processing);
        assert_eq!(r.reason.as_deref(), Some("blocked"));
        assert_eq!(r.metadata.unwrap()["rule"], "adult-content");
    }

    #[test]
    fn test_execution_result_status_helpers() {
        assert!(ActionExecutionResult::completed().is_success());
        let prevented = ActionExecutionResult::prevented("policy");
        assert!(prevented.is_prevented());
        assert!(!prevented.is_success());
        let failed = ActionExecutionResult::failed("boom");
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.status.to_string(), "failed");
        assert_eq!(
            ActionExecutionResult::not_executed("not registered").status,
            ActionStatus::NotExecuted
        );
    }

    #[tokio::test]
    async fn test_deferred_action_runs_only_when_awaited() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = Arc::clone(&flag);
        let action = DeferredAction::new(async move {
            f.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
        action.run().await.unwrap();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_preserve_options_from_config() {
        let mut config = ContextConfig::default();
        config.sanitize = false;
        let options = PreserveOptions::from_config(&config);
        assert!(options.validate);
        assert!(!options.sanitize);
        assert!(options.origin.is_none());
    }
}
