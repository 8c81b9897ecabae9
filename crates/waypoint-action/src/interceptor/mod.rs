//! Action interception.
//!
//! An [`ActionInterceptor`] decides whether an action may run. It checks the
//! prevention policy first (global flag, then condition predicates), then
//! runs the interceptor chain in descending priority order. It also holds
//! the registry of named actions dispatched by [`ActionInterceptor::execute_action`]
//! and the navigation sub-pipeline in [`navigation`].

pub mod navigation;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypoint_core::config::InterceptorConfig;
use waypoint_core::types::{SearchResult, Timestamp};

use crate::error::ActionError;
use crate::types::{
    ActionExecutionResult, InterceptionOutcome, InterceptionResult, InterceptorStatistics,
    SecureActionContext,
};
use navigation::{LoggingNavigator, NavigationHandler, NavigationMiddleware, Navigator, UrlTransform};

/// One link of the interception chain.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Inspect an action. `Err` stops the chain and prevents the action.
    async fn intercept(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<InterceptionResult, String>;
}

struct FnInterceptor<F>(F);

#[async_trait]
impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(&SearchResult, &SecureActionContext) -> Result<InterceptionResult, String> + Send + Sync,
{
    async fn intercept(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<InterceptionResult, String> {
        (self.0)(result, context)
    }
}

/// Wrap a synchronous closure as an [`Interceptor`].
pub fn interceptor_fn<F>(f: F) -> Arc<dyn Interceptor>
where
    F: Fn(&SearchResult, &SecureActionContext) -> Result<InterceptionResult, String>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnInterceptor(f))
}

/// A named action dispatched by type.
#[async_trait]
pub trait RegisteredAction: Send + Sync {
    async fn execute(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<Value, String>;
}

struct FnAction<F>(F);

#[async_trait]
impl<F> RegisteredAction for FnAction<F>
where
    F: Fn(&SearchResult, &SecureActionContext) -> Result<Value, String> + Send + Sync,
{
    async fn execute(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<Value, String> {
        (self.0)(result, context)
    }
}

/// Wrap a synchronous closure as a [`RegisteredAction`].
pub fn action_fn<F>(f: F) -> Arc<dyn RegisteredAction>
where
    F: Fn(&SearchResult, &SecureActionContext) -> Result<Value, String> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

/// Predicate checked before the chain. `true` prevents the action.
pub type PreventionCondition = Arc<dyn Fn(&SearchResult, &SecureActionContext) -> bool + Send + Sync>;

/// Invoked once per policy prevention with the triggering reason.
pub type PreventionHandler = Arc<dyn Fn(&SearchResult, &str) + Send + Sync>;

/// Handle returned by `add_interceptor`.
pub type InterceptorId = Uuid;

pub const GLOBAL_PREVENT_REASON: &str = "Global prevention enabled";

struct InterceptorEntry {
    id: InterceptorId,
    name: String,
    priority: i32,
    interceptor: Arc<dyn Interceptor>,
}

/// Options for `register_action`.
#[derive(Debug, Clone)]
pub struct RegisterOptions {
    pub priority: i32,
    /// Run the interception pipeline before the handler.
    pub preventable: bool,
    pub metadata: Option<Map<String, Value>>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            preventable: true,
            metadata: None,
        }
    }
}

struct ActionRegistration {
    handler: Arc<dyn RegisteredAction>,
    priority: i32,
    preventable: bool,
    metadata: Option<Map<String, Value>>,
    registered_at: Timestamp,
}

/// Public view of a registered action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRegistrationInfo {
    pub action_type: String,
    pub priority: i32,
    pub preventable: bool,
    pub metadata: Option<Map<String, Value>>,
    pub registered_at: Timestamp,
}

/// Prevention policy, interceptor chain, action registry and navigation.
pub struct ActionInterceptor {
    config: InterceptorConfig,
    navigator: Arc<dyn Navigator>,
    chain: RwLock<Vec<InterceptorEntry>>,
    registry: RwLock<HashMap<String, ActionRegistration>>,
    global_prevent: AtomicBool,
    conditions: RwLock<Vec<(String, PreventionCondition)>>,
    prevention_handler: RwLock<Option<PreventionHandler>>,
    url_transform: RwLock<Option<UrlTransform>>,
    middleware: RwLock<Vec<(String, Arc<dyn NavigationMiddleware>)>>,
    navigation_handler: RwLock<Option<Arc<dyn NavigationHandler>>>,
    stats: Mutex<InterceptorStatistics>,
}

impl fmt::Debug for ActionInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionInterceptor")
            .field("config", &self.config)
            .field("interceptors", &self.interceptor_names())
            .field("global_prevent", &self.global_prevent.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ActionInterceptor {
    /// Create an interceptor using the [`LoggingNavigator`] for default
    /// navigation. The global prevent flag starts from `config.prevent_default`.
    pub fn new(config: InterceptorConfig) -> Self {
        Self {
            global_prevent: AtomicBool::new(config.prevent_default),
            config,
            navigator: Arc::new(LoggingNavigator),
            chain: RwLock::new(Vec::new()),
            registry: RwLock::new(HashMap::new()),
            conditions: RwLock::new(Vec::new()),
            prevention_handler: RwLock::new(None),
            url_transform: RwLock::new(None),
            middleware: RwLock::new(Vec::new()),
            navigation_handler: RwLock::new(None),
            stats: Mutex::new(InterceptorStatistics::default()),
        }
    }

    /// Replace the default navigator.
    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Chain
    // -------------------------------------------------------------------------

    /// Add an interceptor. Higher priorities run first; equal priorities run
    /// in registration order.
    pub fn add_interceptor(
        &self,
        name: impl Into<String>,
        priority: i32,
        interceptor: Arc<dyn Interceptor>,
    ) -> InterceptorId {
        let id = Uuid::new_v4();
        let name = name.into();
        debug!(interceptor = %name, priority, "Interceptor added");

        let mut chain = self.chain.write().unwrap_or_else(|e| e.into_inner());
        // Insert after every entry with priority >= ours; keeps the sort stable.
        let position = chain
            .iter()
            .position(|entry| entry.priority < priority)
            .unwrap_or(chain.len());
        chain.insert(
            position,
            InterceptorEntry {
                id,
                name,
                priority,
                interceptor,
            },
        );
        id
    }

    /// Add a synchronous closure as an interceptor.
    pub fn add_interceptor_fn<F>(&self, name: impl Into<String>, priority: i32, f: F) -> InterceptorId
    where
        F: Fn(&SearchResult, &SecureActionContext) -> Result<InterceptionResult, String>
            + Send
            + Sync
            + 'static,
    {
        self.add_interceptor(name, priority, interceptor_fn(f))
    }

    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        let mut chain = self.chain.write().unwrap_or_else(|e| e.into_inner());
        let before = chain.len();
        chain.retain(|entry| entry.id != id);
        chain.len() != before
    }

    /// Interceptor names in execution order.
    pub fn interceptor_names(&self) -> Vec<String> {
        self.chain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Prevention policy
    // -------------------------------------------------------------------------

    pub fn set_global_prevent(&self, prevent: bool) {
        self.global_prevent.store(prevent, Ordering::SeqCst);
    }

    pub fn is_global_prevent(&self) -> bool {
        self.global_prevent.load(Ordering::SeqCst)
    }

    pub fn add_prevention_condition<F>(&self, name: impl Into<String>, condition: F)
    where
        F: Fn(&SearchResult, &SecureActionContext) -> bool + Send + Sync + 'static,
    {
        self.conditions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), Arc::new(condition)));
    }

    pub fn set_prevention_handler<F>(&self, handler: F)
    where
        F: Fn(&SearchResult, &str) + Send + Sync + 'static,
    {
        *self
            .prevention_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// The reason the policy prevents this action, if any.
    fn check_prevention(&self, result: &SearchResult, context: &SecureActionContext) -> Option<String> {
        if self.is_global_prevent() {
            return Some(GLOBAL_PREVENT_REASON.to_string());
        }
        let conditions = self.conditions.read().unwrap_or_else(|e| e.into_inner()).clone();
        conditions
            .iter()
            .find(|(_, condition)| condition(result, context))
            .map(|(name, _)| format!("Prevention condition '{}' matched", name))
    }

    // -------------------------------------------------------------------------
    // Interception
    // -------------------------------------------------------------------------

    /// Run the prevention policy and the interceptor chain.
    ///
    /// `url` is the explicitly requested navigation URL, if any. When the
    /// action is allowed and a URL is available (explicit or on the result),
    /// `custom_navigation` is set if navigation interception is enabled.
    pub async fn intercept(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
        url: Option<&str>,
    ) -> InterceptionOutcome {
        let started = Instant::now();
        let mut outcome = InterceptionOutcome::default();

        if let Some(reason) = self.check_prevention(result, context) {
            info!(result_id = %result.id, reason = %reason, "Action prevented by policy");
            let handler = self
                .prevention_handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(handler) = handler {
                handler(result, &reason);
            }
            outcome.prevented = true;
            outcome.reason = Some(reason);
            self.record(&outcome, started);
            return outcome;
        }

        let chain: Vec<(String, Arc<dyn Interceptor>)> = self
            .chain
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|entry| (entry.name.clone(), Arc::clone(&entry.interceptor)))
            .collect();

        for (name, interceptor) in chain {
            outcome.interceptors_run += 1;
            match interceptor.intercept(result, context).await {
                Ok(verdict) => {
                    if let Some(metadata) = verdict.metadata {
                        outcome.metadata.extend(metadata);
                    }
                    if verdict.prevent_default {
                        outcome.prevented = true;
                        if outcome.reason.is_none() {
                            outcome.reason = verdict.reason.filter(|r| !r.is_empty());
                        }
                        if outcome.custom_action.is_none() {
                            outcome.custom_action = verdict.custom_action;
                        }
                        debug!(interceptor = %name, result_id = %result.id, "Interceptor prevented action");
                    }
                    if verdict.stop_processing {
                        debug!(interceptor = %name, "Interceptor chain stopped");
                        break;
                    }
                }
                Err(e) => {
                    warn!(interceptor = %name, result_id = %result.id, error = %e, "Interceptor failed");
                    let failure = ActionError::InterceptorFailed {
                        name: name.clone(),
                        reason: e,
                    }
                    .to_string();
                    outcome.prevented = true;
                    if outcome.reason.is_none() {
                        outcome.reason = Some(failure.clone());
                    }
                    outcome.error = Some(failure);
                    break;
                }
            }
        }

        if outcome.prevented && outcome.reason.is_none() {
            outcome.reason = Some("Prevented by interceptor".to_string());
        }
        if !outcome.prevented {
            outcome.custom_navigation =
                self.config.intercept_navigation && url.or(result.url.as_deref()).is_some();
        }

        self.record(&outcome, started);
        outcome
    }

    fn record(&self, outcome: &InterceptionOutcome, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_interceptions += 1;
        if outcome.prevented {
            stats.prevented_actions += 1;
        } else {
            stats.executed_actions += 1;
        }
        if outcome.custom_navigation {
            stats.custom_navigations += 1;
        }
        stats.total_time_ms += elapsed;
        stats.average_time_ms = stats.total_time_ms / stats.total_interceptions as f64;
    }

    pub fn get_statistics(&self) -> InterceptorStatistics {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = InterceptorStatistics::default();
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register a named action. Re-registering a type replaces it.
    pub fn register_action(
        &self,
        action_type: impl Into<String>,
        handler: Arc<dyn RegisteredAction>,
        options: RegisterOptions,
    ) {
        let action_type = action_type.into();
        let replaced = self
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                action_type.clone(),
                ActionRegistration {
                    handler,
                    priority: options.priority,
                    preventable: options.preventable,
                    metadata: options.metadata,
                    registered_at: Timestamp::now(),
                },
            )
            .is_some();
        debug!(action_type = %action_type, replaced, "Action registered");
    }

    /// Register a synchronous closure as a named action.
    pub fn register_action_fn<F>(&self, action_type: impl Into<String>, options: RegisterOptions, f: F)
    where
        F: Fn(&SearchResult, &SecureActionContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register_action(action_type, action_fn(f), options);
    }

    pub fn unregister_action(&self, action_type: &str) -> bool {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(action_type)
            .is_some()
    }

    /// Registered actions, highest priority first.
    pub fn registered_actions(&self) -> Vec<ActionRegistrationInfo> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let mut actions: Vec<ActionRegistrationInfo> = registry
            .iter()
            .map(|(action_type, r)| ActionRegistrationInfo {
                action_type: action_type.clone(),
                priority: r.priority,
                preventable: r.preventable,
                metadata: r.metadata.clone(),
                registered_at: r.registered_at,
            })
            .collect();
        actions.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.action_type.cmp(&b.action_type))
        });
        actions
    }

    /// Run a registered action by type.
    ///
    /// Unknown types yield a not-executed result. Preventable actions go
    /// through [`intercept`](Self::intercept) first; a prevented action runs
    /// its custom action (if any) instead of the handler. Handler errors are
    /// reported as failed results.
    pub async fn execute_action(
        &self,
        action_type: &str,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> ActionExecutionResult {
        let started = Instant::now();
        let registration = self
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(action_type)
            .map(|r| (Arc::clone(&r.handler), r.preventable));

        let Some((handler, preventable)) = registration else {
            return ActionExecutionResult::not_executed(
                ActionError::UnregisteredAction(action_type.to_string()).to_string(),
            )
            .with_context_id(context.context_id());
        };

        let mut outcome = if preventable {
            let interception = self.intercept(result, context, None).await;
            if interception.prevented {
                if let Some(action) = interception.custom_action {
                    if let Err(e) = action.run().await {
                        warn!(action_type = %action_type, error = %e, "Custom action failed");
                    }
                }
                let mut prevented = ActionExecutionResult::prevented(
                    interception.reason.unwrap_or_default(),
                );
                prevented.metadata = interception.metadata;
                prevented
            } else {
                self.run_handler(action_type, handler, result, context).await
            }
        } else {
            self.run_handler(action_type, handler, result, context).await
        };

        outcome.context_id = Some(context.context_id());
        outcome.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        outcome
    }

    async fn run_handler(
        &self,
        action_type: &str,
        handler: Arc<dyn RegisteredAction>,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> ActionExecutionResult {
        match handler.execute(result, context).await {
            Ok(output) => {
                debug!(action_type = %action_type, result_id = %result.id, "Registered action executed");
                ActionExecutionResult::completed().with_output(output)
            }
            Err(e) => {
                warn!(action_type = %action_type, result_id = %result.id, error = %e, "Registered action failed");
                ActionExecutionResult::failed(ActionError::HandlerFailed(e).to_string())
            }
        }
    }
}
