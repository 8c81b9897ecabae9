//! Action pipeline for Waypoint.
//!
//! Turns a selected search result into an executed action: preserves a
//! secured context snapshot, runs the interception chain, navigates or
//! invokes callbacks, and releases the resources each action created.

pub mod cleanup;
pub mod context;
pub mod error;
pub mod executor;
pub mod interceptor;
pub mod orchestrator;
pub mod types;

pub use cleanup::{CleanupResult, ResourceCleanupManager, ResourceKind, TrackOptions};
pub use context::ContextPreserver;
pub use error::{ActionError, CleanupError, ContextError};
pub use executor::{CallbackExecutor, TimedCallbackExecutor};
pub use interceptor::navigation::{LoggingNavigator, NavigationHandler, NavigationMiddleware, Navigator};
pub use interceptor::{ActionInterceptor, Interceptor, RegisterOptions, RegisteredAction};
pub use orchestrator::{ActionHandler, HandlerBuilder, HandlerCleanupReport};
pub use types::{
    ActionContext, ActionExecutionResult, ActionOptions, ActionStatistics, ActionStatus,
    DeferredAction, InterceptionResult, NavigationOptions, SecureActionContext, SourceInfo,
    UserInfo,
};
