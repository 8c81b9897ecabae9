//! Navigation sub-pipeline.
//!
//! Resolve URL, apply the URL transform, run the middleware chain, then hand
//! off to a custom navigation handler or the default [`Navigator`]. Every
//! stage failure ends in a prevented result carrying the reason.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use waypoint_core::types::{NavigationTarget, SearchResult};

use super::ActionInterceptor;
use crate::error::ActionError;
use crate::types::{ActionExecutionResult, NavigationOptions, NavigationRecord, SecureActionContext};

/// Rewrites the resolved URL before middleware runs.
pub type UrlTransform = Arc<dyn Fn(&str, &SearchResult) -> Result<String, String> + Send + Sync>;

/// A navigation guard. Returning `Ok(false)` vetoes the navigation.
#[async_trait]
pub trait NavigationMiddleware: Send + Sync {
    async fn allow(
        &self,
        url: &str,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<bool, String>;
}

/// Replaces the default navigator for every navigation.
#[async_trait]
pub trait NavigationHandler: Send + Sync {
    async fn navigate(
        &self,
        url: &str,
        target: NavigationTarget,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<(), String>;
}

/// Performs the actual navigation side effect.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn open(&self, url: &str, target: NavigationTarget) -> Result<(), ActionError>;
}

/// Default navigator: accepts `http://` and `https://` URLs and logs them.
///
/// Hosts that can actually open a browser or a view inject their own
/// [`Navigator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNavigator;

#[async_trait]
impl Navigator for LoggingNavigator {
    async fn open(&self, url: &str, target: NavigationTarget) -> Result<(), ActionError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ActionError::NavigationFailed(format!(
                "Unsupported URL scheme. Only http:// and https:// are allowed, got: {}",
                url
            )));
        }
        info!(url = %url, target = %target, "Navigated");
        Ok(())
    }
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F> NavigationMiddleware for FnMiddleware<F>
where
    F: Fn(&str, &SearchResult, &SecureActionContext) -> Result<bool, String> + Send + Sync,
{
    async fn allow(
        &self,
        url: &str,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<bool, String> {
        (self.0)(url, result, context)
    }
}

/// Wrap a synchronous closure as [`NavigationMiddleware`].
pub fn middleware_fn<F>(f: F) -> Arc<dyn NavigationMiddleware>
where
    F: Fn(&str, &SearchResult, &SecureActionContext) -> Result<bool, String>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

struct FnNavigationHandler<F>(F);

#[async_trait]
impl<F> NavigationHandler for FnNavigationHandler<F>
where
    F: Fn(&str, NavigationTarget, &SearchResult, &SecureActionContext) -> Result<(), String>
        + Send
        + Sync,
{
    async fn navigate(
        &self,
        url: &str,
        target: NavigationTarget,
        result: &SearchResult,
        context: &SecureActionContext,
    ) -> Result<(), String> {
        (self.0)(url, target, result, context)
    }
}

/// Wrap a synchronous closure as a [`NavigationHandler`].
pub fn navigation_handler_fn<F>(f: F) -> Arc<dyn NavigationHandler>
where
    F: Fn(&str, NavigationTarget, &SearchResult, &SecureActionContext) -> Result<(), String>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnNavigationHandler(f))
}

fn prevented(reason: String, context: &SecureActionContext, started: Instant) -> ActionExecutionResult {
    debug!(reason = %reason, "Navigation prevented");
    let mut result = ActionExecutionResult::prevented(reason).with_context_id(context.context_id());
    result.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    result
}

impl ActionInterceptor {
    /// Replace the URL transform.
    pub fn set_url_transform<F>(&self, transform: F)
    where
        F: Fn(&str, &SearchResult) -> Result<String, String> + Send + Sync + 'static,
    {
        *self.url_transform.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(transform));
    }

    /// Append a middleware. Middleware runs in insertion order.
    pub fn add_middleware(&self, name: impl Into<String>, middleware: Arc<dyn NavigationMiddleware>) {
        self.middleware
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), middleware));
    }

    /// Install (or with `None`, remove) the custom navigation handler.
    pub fn set_navigation_handler(&self, handler: Option<Arc<dyn NavigationHandler>>) {
        *self.navigation_handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Run the navigation pipeline for a result.
    ///
    /// The URL comes from `options.url`, falling back to the result's URL;
    /// the target from `options.target`, falling back to the configured
    /// default.
    pub async fn handle_navigation(
        &self,
        result: &SearchResult,
        context: &SecureActionContext,
        options: &NavigationOptions,
    ) -> ActionExecutionResult {
        let started = Instant::now();

        let Some(url) = options.url.clone().or_else(|| result.url.clone()) else {
            return prevented("No URL available for navigation".to_string(), context, started);
        };
        let target = options.target.unwrap_or(self.config.default_target);

        let transform = self
            .url_transform
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let url = match transform {
            Some(transform) => match transform(&url, result) {
                Ok(rewritten) => {
                    debug!(from = %url, to = %rewritten, "URL transformed");
                    rewritten
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "URL transform failed");
                    return prevented(format!("URL transform failed: {}", e), context, started);
                }
            },
            None => url,
        };

        let middleware = self
            .middleware
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (name, mw) in middleware {
            match mw.allow(&url, result, context).await {
                Ok(true) => {}
                Ok(false) => {
                    return prevented(
                        format!("Navigation blocked by middleware '{}'", name),
                        context,
                        started,
                    );
                }
                Err(e) => {
                    warn!(middleware = %name, error = %e, "Navigation middleware failed");
                    return prevented(
                        format!("Navigation middleware '{}' failed: {}", name, e),
                        context,
                        started,
                    );
                }
            }
        }

        let handler = self
            .navigation_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let custom_handler = handler.is_some();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.navigate(&url, target, result, context).await {
                    warn!(url = %url, error = %e, "Custom navigation handler failed");
                    return prevented(format!("Navigation handler failed: {}", e), context, started);
                }
            }
            None if self.config.prevent_default_navigation => {
                return prevented("Default navigation prevented".to_string(), context, started);
            }
            None => {
                if let Err(e) = self.navigator.open(&url, target).await {
                    warn!(url = %url, error = %e, "Default navigation failed");
                    return prevented(e.to_string(), context, started);
                }
            }
        }

        let mut outcome = ActionExecutionResult::completed()
            .with_context_id(context.context_id())
            .with_navigation(NavigationRecord {
                url,
                target,
                custom_handler,
            });
        outcome.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        outcome
    }
}
