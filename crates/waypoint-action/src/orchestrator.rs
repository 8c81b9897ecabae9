//! Action handler orchestrator.
//!
//! Coordinates the full pipeline for one selected result: admission,
//! context creation and preservation, interception, execution (navigation,
//! custom action or callback), resource cleanup, lifecycle events and
//! statistics.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use waypoint_core::config::WaypointConfig;
use waypoint_core::events::{
    ActionEvent, EventBus, EventCallback, InMemoryEventBus, SubscribeOptions, SubscriptionId,
};
use waypoint_core::types::{ErrorStrategy, SearchResult, Timestamp};

use crate::cleanup::{ResourceCleanupManager, ResourceKind, TrackOptions};
use crate::context::ContextPreserver;
use crate::error::{ActionError, ContextError};
use crate::executor::{CallbackExecutor, TimedCallbackExecutor};
use crate::interceptor::navigation::Navigator;
use crate::interceptor::ActionInterceptor;
use crate::types::{
    ActionExecutionResult, ActionOptions, ActionStatistics, ActionStatus, EnrichmentConfig,
    PreserveOptions,
};

/// Outcome of [`ActionHandler::cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerCleanupReport {
    pub cleaned: usize,
    pub errors: Vec<String>,
}

/// An admitted action that has not finished yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveActionInfo {
    pub action_id: Uuid,
    pub result_id: String,
    pub started_at: Timestamp,
}

struct HandlerInner {
    config: WaypointConfig,
    preserver: Arc<ContextPreserver>,
    interceptor: Arc<ActionInterceptor>,
    cleanup: ResourceCleanupManager,
    event_bus: Arc<dyn EventBus>,
    executor: Arc<dyn CallbackExecutor>,
    admission: Arc<Semaphore>,
    active: Mutex<HashMap<Uuid, ActiveActionInfo>>,
    stats: Mutex<ActionStatistics>,
    callbacks: Mutex<Vec<SubscriptionId>>,
}

impl HandlerInner {
    fn remove_active(&self, action_id: Uuid) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&action_id);
    }
}

/// Removes the active-action record and its cleanup group even if the
/// pipeline panics or the caller drops the `process_action` future.
struct ActiveGuard {
    inner: Weak<HandlerInner>,
    action_id: Uuid,
    group: Option<String>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_active(self.action_id);
            if let Some(group) = &self.group {
                inner.cleanup.forget_group(group);
            }
        }
    }
}

/// Builder for [`ActionHandler`]. Unset collaborators get in-process defaults.
pub struct HandlerBuilder {
    config: WaypointConfig,
    event_bus: Option<Arc<dyn EventBus>>,
    executor: Option<Arc<dyn CallbackExecutor>>,
    navigator: Option<Arc<dyn Navigator>>,
}

impl HandlerBuilder {
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CallbackExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn build(self) -> ActionHandler {
        let config = self.config;
        let limit = config.handler.max_concurrent_actions.max(1);

        let mut interceptor = ActionInterceptor::new(config.interceptor.clone());
        if let Some(navigator) = self.navigator {
            interceptor = interceptor.with_navigator(navigator);
        }
        let cleanup = ResourceCleanupManager::new(config.cleanup.clone());
        if config.cleanup.leak_detection {
            cleanup.start_leak_detection();
        }

        let inner = HandlerInner {
            preserver: Arc::new(ContextPreserver::new(
                config.context.clone(),
                config.general.actor.clone(),
            )),
            interceptor: Arc::new(interceptor),
            cleanup,
            event_bus: self
                .event_bus
                .unwrap_or_else(|| -> Arc<dyn EventBus> { Arc::new(InMemoryEventBus::new()) }),
            executor: self.executor.unwrap_or_else(|| -> Arc<dyn CallbackExecutor> {
                Arc::new(TimedCallbackExecutor::from_config(&config.handler))
            }),
            admission: Arc::new(Semaphore::new(limit)),
            active: Mutex::new(HashMap::new()),
            stats: Mutex::new(ActionStatistics::default()),
            callbacks: Mutex::new(Vec::new()),
            config,
        };
        info!(max_concurrent_actions = limit, "Action handler ready");
        ActionHandler {
            inner: Arc::new(inner),
        }
    }
}

/// Runs selected search results through the action pipeline.
///
/// Cloning is cheap; clones share components, statistics and the
/// admission limit.
#[derive(Clone)]
pub struct ActionHandler {
    inner: Arc<HandlerInner>,
}

impl fmt::Debug for ActionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandler")
            .field("active_actions", &self.active_actions())
            .field("error_strategy", &self.inner.config.handler.error_strategy)
            .finish_non_exhaustive()
    }
}

impl ActionHandler {
    /// Create a handler with default collaborators.
    pub fn new(config: WaypointConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: WaypointConfig) -> HandlerBuilder {
        HandlerBuilder {
            config,
            event_bus: None,
            executor: None,
            navigator: None,
        }
    }

    pub fn interceptor(&self) -> &Arc<ActionInterceptor> {
        &self.inner.interceptor
    }

    pub fn context_preserver(&self) -> &Arc<ContextPreserver> {
        &self.inner.preserver
    }

    pub fn cleanup_manager(&self) -> &ResourceCleanupManager {
        &self.inner.cleanup
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.inner.event_bus
    }

    /// Actions admitted and not yet finished.
    pub fn active_actions(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Snapshot of in-flight actions, oldest first.
    pub fn active_action_info(&self) -> Vec<ActiveActionInfo> {
        let mut actions: Vec<ActiveActionInfo> = self
            .inner
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.started_at);
        actions
    }

    /// Process one selected result.
    ///
    /// Waits for an admission slot (FIFO) when the concurrency limit is
    /// reached. Prevention and not-executed outcomes are always `Ok`.
    /// Failures are `Err` under [`ErrorStrategy::Throw`] and a failed
    /// result under [`ErrorStrategy::Callback`]; both emit `action:error`.
    pub async fn process_action(
        &self,
        result: SearchResult,
        options: ActionOptions,
    ) -> Result<ActionExecutionResult, ActionError> {
        let _permit = Arc::clone(&self.inner.admission)
            .acquire_owned()
            .await
            .map_err(|_| ActionError::ShuttingDown)?;

        let action_id = Uuid::new_v4();
        let started = Instant::now();
        let _guard = self.begin(action_id, &result).await;
        debug!(action_id = %action_id, result_id = %result.id, "Action admitted");

        self.emit(ActionEvent::ActionStarted {
            action_id,
            result_id: result.id.clone(),
            query: options.query.clone(),
            timestamp: Timestamp::now(),
        })
        .await;

        let mut context_id = None;
        let outcome = self.run_pipeline(action_id, &result, options, &mut context_id).await;

        if self.inner.config.handler.auto_cleanup {
            let cleanup = self
                .inner
                .cleanup
                .cleanup_group(&action_group(action_id))
                .await;
            if !cleanup.success {
                warn!(action_id = %action_id, errors = ?cleanup.errors(), "Action resource cleanup failed");
            }
        }

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(mut executed) => {
                executed.action_id = Some(action_id);
                executed.processing_time_ms = processing_time_ms;
                let prevented = executed.is_prevented();
                if prevented {
                    info!(action_id = %action_id, reason = ?executed.reason, "Action prevented");
                } else {
                    info!(action_id = %action_id, status = %executed.status, "Action completed");
                }
                self.record(executed.status, processing_time_ms);
                self.emit(ActionEvent::ActionCompleted {
                    action_id,
                    result_id: result.id.clone(),
                    success: executed.is_success(),
                    prevented,
                    reason: executed.reason.clone(),
                    processing_time_ms,
                    timestamp: Timestamp::now(),
                })
                .await;
                Ok(executed)
            }
            Err(e) => {
                error!(action_id = %action_id, result_id = %result.id, error = %e, "Action failed");
                self.record(ActionStatus::Failed, processing_time_ms);
                self.emit(ActionEvent::ActionFailed {
                    action_id,
                    result_id: result.id.clone(),
                    error: e.to_string(),
                    processing_time_ms,
                    timestamp: Timestamp::now(),
                })
                .await;

                match self.inner.config.handler.error_strategy {
                    ErrorStrategy::Throw => Err(e),
                    ErrorStrategy::Callback => {
                        let mut failed = ActionExecutionResult::failed(e.to_string());
                        failed.action_id = Some(action_id);
                        failed.context_id = context_id;
                        failed.processing_time_ms = processing_time_ms;
                        Ok(failed)
                    }
                }
            }
        }
    }

    /// Process several results concurrently under the same admission limit.
    ///
    /// Results come back in input order. A failing or panicking action
    /// yields a failed result without affecting its siblings.
    pub async fn process_actions_parallel(
        &self,
        actions: Vec<(SearchResult, ActionOptions)>,
    ) -> Vec<ActionExecutionResult> {
        let handles: Vec<_> = actions
            .into_iter()
            .map(|(result, options)| {
                let handler = self.clone();
                tokio::spawn(async move { handler.process_action(result, options).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let executed = match handle.await {
                Ok(Ok(executed)) => executed,
                Ok(Err(e)) => ActionExecutionResult::failed(e.to_string()),
                Err(e) => {
                    error!(index, error = %e, "Action task aborted");
                    ActionExecutionResult::failed(format!("Action task aborted: {}", e))
                }
            };
            results.push(executed);
        }
        results
    }

    /// Subscribe to lifecycle events. Subscriptions are removed by
    /// [`cleanup`](Self::cleanup).
    pub fn register_action_callback(
        &self,
        event_name: &str,
        callback: EventCallback,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = self.inner.event_bus.subscribe(event_name, callback, options);
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
        id
    }

    pub fn get_statistics(&self) -> ActionStatistics {
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        stats.active_actions = self.active_actions();
        stats
    }

    pub fn reset_statistics(&self) {
        *self.inner.stats.lock().unwrap_or_else(|e| e.into_inner()) = ActionStatistics::default();
        self.inner.interceptor.reset_statistics();
    }

    /// Unsubscribe registered callbacks, release non-critical resources and
    /// clear the context history.
    pub async fn cleanup(&self) -> HandlerCleanupReport {
        let mut report = HandlerCleanupReport::default();

        let subscriptions =
            std::mem::take(&mut *self.inner.callbacks.lock().unwrap_or_else(|e| e.into_inner()));
        for id in subscriptions {
            if self.inner.event_bus.unsubscribe(id) {
                report.cleaned += 1;
            }
        }

        let resources = self.inner.cleanup.cleanup_all(true).await;
        report.cleaned += resources.cleaned;
        report.errors.extend(resources.errors());

        let cleared = self.inner.preserver.clear_history();
        debug!(contexts = cleared, "Context history cleared");
        report
    }

    /// Stop admitting actions and release everything, critical resources
    /// included. Actions waiting for admission fail with `ShuttingDown`.
    pub async fn shutdown(&self) -> HandlerCleanupReport {
        self.inner.admission.close();
        let mut report = self.cleanup().await;
        let remaining = self.inner.cleanup.shutdown().await;
        report.cleaned += remaining.cleaned;
        report.errors.extend(remaining.errors());
        info!(cleaned = report.cleaned, errors = report.errors.len(), "Action handler shut down");
        report
    }

    async fn begin(&self, action_id: Uuid, result: &SearchResult) -> ActiveGuard {
        {
            let mut active = self.inner.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                action_id,
                ActiveActionInfo {
                    action_id,
                    result_id: result.id.clone(),
                    started_at: Timestamp::now(),
                },
            );
            let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.peak_concurrency = stats.peak_concurrency.max(active.len());
        }

        let mut group = None;
        if self.inner.config.handler.auto_cleanup {
            let weak = Arc::downgrade(&self.inner);
            let tracked = self
                .inner
                .cleanup
                .track_resource(
                    ResourceKind::Custom,
                    format!("active-action:{}", result.id),
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.remove_active(action_id);
                        }
                        std::future::ready(Ok(()))
                    },
                    // Critical so bulk cleanup leaves in-flight actions alone.
                    TrackOptions::default()
                        .critical()
                        .in_group(action_group(action_id)),
                )
                .await;
            match tracked {
                Ok(_) => group = Some(action_group(action_id)),
                Err(e) => debug!(action_id = %action_id, error = %e, "Active action not tracked"),
            }
        }

        ActiveGuard {
            inner: Arc::downgrade(&self.inner),
            action_id,
            group,
        }
    }

    async fn run_pipeline(
        &self,
        action_id: Uuid,
        result: &SearchResult,
        options: ActionOptions,
        context_id: &mut Option<Uuid>,
    ) -> Result<ActionExecutionResult, ActionError> {
        let context_config = self.inner.preserver.config();
        let enrichment = EnrichmentConfig {
            user: options.user.clone(),
            custom: options.custom.clone(),
            ..EnrichmentConfig::from_config(context_config)
        };
        let context = self.inner.preserver.create_context(
            result,
            &options.query,
            options.source.as_ref(),
            &enrichment,
        );

        let preserved = self
            .inner
            .preserver
            .preserve_context(&context, &PreserveOptions::from_config(context_config));
        let secured = match (preserved.success, preserved.context) {
            (true, Some(secured)) => secured,
            _ => {
                return Err(preserved
                    .error
                    .unwrap_or_else(|| {
                        ContextError::Serialization("context preservation failed".to_string())
                    })
                    .into());
            }
        };
        *context_id = Some(secured.context_id());
        debug!(action_id = %action_id, context_id = %secured.context_id(), "Context preserved");

        let interception = self
            .inner
            .interceptor
            .intercept(result, &secured, options.navigation.url.as_deref())
            .await;

        if interception.prevented {
            if let Some(action) = interception.custom_action {
                debug!(action_id = %action_id, "Running custom action for prevented action");
                if let Err(e) = action.run().await {
                    warn!(action_id = %action_id, error = %e, "Custom action failed");
                }
            }
            let mut prevented =
                ActionExecutionResult::prevented(interception.reason.unwrap_or_default())
                    .with_context_id(secured.context_id());
            prevented.metadata = interception.metadata;
            return Ok(prevented);
        }

        let mut executed = if interception.custom_navigation {
            self.inner
                .interceptor
                .handle_navigation(result, &secured, &options.navigation)
                .await
        } else if let Some(action) = options.custom_action {
            action.run().await?;
            ActionExecutionResult::completed()
        } else if let Some(callback) = options.callback {
            let output = self
                .inner
                .executor
                .execute(callback, result.clone(), secured.clone())
                .await?;
            ActionExecutionResult::completed().with_output(output)
        } else {
            debug!(action_id = %action_id, "No execution path; nothing to run");
            ActionExecutionResult::completed()
        };

        executed.context_id = Some(secured.context_id());
        executed.metadata.extend(interception.metadata);
        Ok(executed)
    }

    fn record(&self, status: ActionStatus, processing_time_ms: f64) {
        let mut stats = self.inner.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_actions += 1;
        match status {
            ActionStatus::Completed => stats.successful_actions += 1,
            ActionStatus::Prevented => stats.prevented_actions += 1,
            ActionStatus::Failed => stats.failed_actions += 1,
            ActionStatus::NotExecuted => {}
        }
        stats.total_processing_time_ms += processing_time_ms;
        stats.average_processing_time_ms =
            stats.total_processing_time_ms / stats.total_actions as f64;
        stats.last_action_at = Some(Timestamp::now());
    }

    async fn emit(&self, event: ActionEvent) {
        if !self.inner.config.handler.emit_events {
            return;
        }
        let report = self.inner.event_bus.emit(&event).await;
        if report.failed > 0 {
            warn!(
                event = event.event_name(),
                failed = report.failed,
                errors = ?report.errors,
                "Event subscribers failed"
            );
        }
    }
}

fn action_group(action_id: Uuid) -> String {
    format!("action:{}", action_id)
}
