//! End-to-end tests for the action pipeline.
//!
//! Each test builds its own handler with a recording navigator so no real
//! navigation happens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use waypoint_action::cleanup::{ResourceCleanupManager, ResourceKind, TrackOptions};
use waypoint_action::context::ContextPreserver;
use waypoint_action::interceptor::GLOBAL_PREVENT_REASON;
use waypoint_action::types::{EnrichmentConfig, PreserveOptions};
use waypoint_action::{
    ActionError, ActionHandler, ActionOptions, ActionStatus, InterceptionResult, Navigator,
    UserInfo,
};
use waypoint_core::config::{CleanupConfig, ContextConfig, WaypointConfig};
use waypoint_core::types::{NavigationTarget, SearchResult};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct RecordingNavigator {
    opened: Mutex<Vec<(String, NavigationTarget)>>,
}

impl RecordingNavigator {
    fn opened(&self) -> Vec<(String, NavigationTarget)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Navigator for RecordingNavigator {
    async fn open(&self, url: &str, target: NavigationTarget) -> Result<(), ActionError> {
        self.opened.lock().unwrap().push((url.to_string(), target));
        Ok(())
    }
}

fn test_config() -> WaypointConfig {
    let mut config = WaypointConfig::default();
    config.cleanup.leak_detection = false;
    config
}

fn make_handler(config: WaypointConfig) -> (ActionHandler, Arc<RecordingNavigator>) {
    let navigator = Arc::new(RecordingNavigator::default());
    let handler = ActionHandler::builder(config)
        .navigator(navigator.clone())
        .build();
    (handler, navigator)
}

fn result_with_url(id: &str, url: &str) -> SearchResult {
    SearchResult::new(id, "Result").with_url(url)
}

fn cleanup_manager() -> ResourceCleanupManager {
    ResourceCleanupManager::new(CleanupConfig {
        leak_detection: false,
        ..CleanupConfig::default()
    })
}

// =============================================================================
// Context preservation
// =============================================================================

#[tokio::test]
async fn test_every_preserved_context_gets_a_fresh_id() {
    let preserver = ContextPreserver::new(ContextConfig::default(), "pipeline-tests");
    let result = SearchResult::new("r1", "Result");
    let context = preserver.create_context(
        &result,
        "rust async",
        None,
        &EnrichmentConfig::default(),
    );

    let options = PreserveOptions::default();
    let first = preserver.preserve_context(&context, &options).context.unwrap();
    let second = preserver.preserve_context(&context, &options).context.unwrap();

    assert_ne!(first.context_id(), second.context_id());
    assert_eq!(preserver.history_len(), 2);
}

#[tokio::test]
async fn test_invalid_contexts_are_not_recorded() {
    let preserver = ContextPreserver::new(ContextConfig::default(), "pipeline-tests");
    let result = SearchResult::new("r1", "Result");
    let context = preserver.create_context(&result, "", None, &EnrichmentConfig::default());

    let empty_query = preserver.preserve_context(&context, &PreserveOptions::default());
    assert!(!empty_query.success);
    assert!(empty_query.context.is_none());

    let bad_timestamp = preserver.preserve_value(
        json!({
            "query": "rust",
            "timestamp": "yesterday",
            "source": {"type": "search"},
            "search": {"totalResults": 1, "processingTime": 0.0, "resultIndex": 0}
        }),
        &PreserveOptions::default(),
    );
    assert!(!bad_timestamp.success);

    assert_eq!(preserver.history_len(), 0);
}

#[tokio::test]
async fn test_restricting_required_fields_does_not_break_actions() {
    let mut config = test_config();
    config.context.security.restricted_fields =
        vec!["user.id".to_string(), "query".to_string(), "user.sessionId".to_string()];
    let (handler, _) = make_handler(config);

    let options = ActionOptions::new("rust")
        .with_user(UserInfo::new("u1").with_session("s-42"))
        .with_callback(|_, context| async move {
            Ok(json!({
                "query": context.context.query,
                "user": context.context.user.as_ref().map(|u| u.id.clone()),
                "session": context.context.user.and_then(|u| u.session_id),
            }))
        });
    let executed = handler
        .process_action(SearchResult::new("r1", "Result"), options)
        .await
        .unwrap();

    assert_eq!(executed.status, ActionStatus::Completed, "{:?}", executed.error);
    let output = executed.output.unwrap();
    assert_eq!(output["query"], "rust");
    assert_eq!(output["user"], "u1");
    assert_eq!(output["session"], Value::Null);
}

// =============================================================================
// Interception
// =============================================================================

#[tokio::test]
async fn test_interceptors_run_by_descending_priority() {
    let (handler, _) = make_handler(test_config());
    let order = Arc::new(Mutex::new(Vec::new()));
    for priority in [1, 5, 3] {
        let order = Arc::clone(&order);
        handler
            .interceptor()
            .add_interceptor_fn(format!("p{}", priority), priority, move |_, _| {
                order.lock().unwrap().push(priority);
                Ok(InterceptionResult::proceed())
            });
    }

    handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();
    assert_eq!(*order.lock().unwrap(), vec![5, 3, 1]);
}

#[tokio::test]
async fn test_stop_processing_skips_remaining_interceptors() {
    let (handler, nav) = make_handler(test_config());
    let order = Arc::new(Mutex::new(Vec::new()));
    for priority in [1, 5, 3] {
        let order = Arc::clone(&order);
        handler
            .interceptor()
            .add_interceptor_fn(format!("p{}", priority), priority, move |_, _| {
                order.lock().unwrap().push(priority);
                if priority == 5 {
                    Ok(InterceptionResult::proceed().stop())
                } else {
                    Ok(InterceptionResult::proceed())
                }
            });
    }

    let executed = handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();
    assert_eq!(*order.lock().unwrap(), vec![5]);
    assert!(executed.is_success());
    assert_eq!(nav.opened().len(), 1);
}

#[tokio::test]
async fn test_global_prevention_short_circuits() {
    let (handler, nav) = make_handler(test_config());
    let handled = Arc::new(AtomicUsize::new(0));
    let chain_runs = Arc::new(AtomicUsize::new(0));

    let h = Arc::clone(&handled);
    handler
        .interceptor()
        .set_prevention_handler(move |_, reason| {
            assert_eq!(reason, GLOBAL_PREVENT_REASON);
            h.fetch_add(1, Ordering::SeqCst);
        });
    let c = Arc::clone(&chain_runs);
    handler.interceptor().add_interceptor_fn("audit", 0, move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(InterceptionResult::proceed())
    });
    handler.interceptor().set_global_prevent(true);

    let executed = handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();

    assert_eq!(executed.status, ActionStatus::Prevented);
    assert_eq!(executed.reason.as_deref(), Some(GLOBAL_PREVENT_REASON));
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(chain_runs.load(Ordering::SeqCst), 0);
    assert!(nav.opened().is_empty());
}

#[tokio::test]
async fn test_silent_veto_gets_generic_reason() {
    let (handler, nav) = make_handler(test_config());
    handler.interceptor().add_interceptor_fn("quiet", 0, |_, _| {
        Ok(InterceptionResult {
            prevent_default: true,
            ..InterceptionResult::proceed()
        })
    });

    let executed = handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();
    assert!(executed.is_prevented());
    assert_eq!(executed.reason.as_deref(), Some("Prevented by interceptor"));
    assert!(nav.opened().is_empty());
}

#[tokio::test]
async fn test_failing_interceptor_fails_closed() {
    let (handler, nav) = make_handler(test_config());
    handler
        .interceptor()
        .add_interceptor_fn("flaky", 0, |_, _| Err("policy store unreachable".to_string()));

    let executed = handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();
    assert!(executed.is_prevented());
    assert!(executed.reason.unwrap().contains("flaky"));
    assert!(nav.opened().is_empty());
}

// =============================================================================
// Navigation
// =============================================================================

#[tokio::test]
async fn test_default_navigation_opens_same_tab() {
    let (handler, nav) = make_handler(test_config());

    let executed = handler
        .process_action(result_with_url("r1", "https://x/y"), ActionOptions::new("q"))
        .await
        .unwrap();

    assert!(executed.is_success());
    let navigation = executed.navigation.unwrap();
    assert_eq!(navigation.url, "https://x/y");
    assert_eq!(navigation.target, NavigationTarget::SameTab);
    assert!(!navigation.custom_handler);
    assert_eq!(
        nav.opened(),
        vec![("https://x/y".to_string(), NavigationTarget::SameTab)]
    );
}

#[tokio::test]
async fn test_explicit_url_and_target_override_result() {
    let (handler, nav) = make_handler(test_config());
    let options = ActionOptions::new("q")
        .with_url("https://docs.rs/tokio")
        .with_target(NavigationTarget::NewTab);

    handler
        .process_action(result_with_url("r1", "https://x/y"), options)
        .await
        .unwrap();
    assert_eq!(
        nav.opened(),
        vec![("https://docs.rs/tokio".to_string(), NavigationTarget::NewTab)]
    );
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test]
async fn test_admission_is_fifo_at_capacity() {
    let mut config = test_config();
    config.handler.max_concurrent_actions = 1;
    let (handler, _) = make_handler(config);

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let first_started = Arc::new(Notify::new());
    let release_first = Arc::new(Notify::new());

    let options_for = |name: &'static str| {
        let log = Arc::clone(&log);
        let first_started = Arc::clone(&first_started);
        let release_first = Arc::clone(&release_first);
        ActionOptions::new("q").with_callback(move |_, _| {
            let log = Arc::clone(&log);
            let first_started = Arc::clone(&first_started);
            let release_first = Arc::clone(&release_first);
            async move {
                log.lock().unwrap().push(format!("{}-start", name));
                if name == "a" {
                    first_started.notify_one();
                    release_first.notified().await;
                }
                log.lock().unwrap().push(format!("{}-end", name));
                Ok(Value::from(name))
            }
        })
    };

    let h = handler.clone();
    let opts = options_for("a");
    let a = tokio::spawn(async move { h.process_action(SearchResult::new("a", "A"), opts).await });
    first_started.notified().await;

    let h = handler.clone();
    let opts = options_for("b");
    let b = tokio::spawn(async move { h.process_action(SearchResult::new("b", "B"), opts).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let h = handler.clone();
    let opts = options_for("c");
    let c = tokio::spawn(async move { h.process_action(SearchResult::new("c", "C"), opts).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*log.lock().unwrap(), vec!["a-start"]);
    assert_eq!(handler.active_actions(), 1);

    release_first.notify_one();
    let outputs: Vec<Value> = vec![
        a.await.unwrap().unwrap().output.unwrap(),
        b.await.unwrap().unwrap().output.unwrap(),
        c.await.unwrap().unwrap().output.unwrap(),
    ];

    assert_eq!(outputs, vec![json!("a"), json!("b"), json!("c")]);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["a-start", "a-end", "b-start", "b-end", "c-start", "c-end"]
    );
    assert_eq!(handler.get_statistics().peak_concurrency, 1);
}

// =============================================================================
// Resource cleanup
// =============================================================================

#[tokio::test]
async fn test_cleaning_a_resource_twice_reports_false() {
    let manager = cleanup_manager();
    let id = manager
        .track_resource(
            ResourceKind::Connection,
            "db-pool",
            || async { Ok(()) },
            TrackOptions::default(),
        )
        .await
        .unwrap();

    assert!(manager.cleanup_resource(id).await);
    assert!(!manager.cleanup_resource(id).await);
}

async fn track_three_with_failing_middle(manager: &ResourceCleanupManager, group: &str) {
    for (i, fails) in [false, true, false].into_iter().enumerate() {
        manager
            .track_resource(
                ResourceKind::Custom,
                format!("{}-{}", group, i),
                move || async move {
                    if fails {
                        Err("still in use".to_string())
                    } else {
                        Ok(())
                    }
                },
                TrackOptions::default().in_group(group),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_atomic_group_cleans_nothing_on_failure() {
    let manager = cleanup_manager();
    manager.create_group("session", 0, true);
    track_three_with_failing_middle(&manager, "session").await;

    let result = manager.cleanup_group("session").await;
    assert!(!result.success);
    assert_eq!(result.cleaned, 0);
    assert_eq!(result.failed, 3);
    assert_eq!(manager.resource_count(), 3);
}

#[tokio::test]
async fn test_non_atomic_group_cleans_what_it_can() {
    let manager = cleanup_manager();
    manager.create_group("session", 0, false);
    track_three_with_failing_middle(&manager, "session").await;

    let result = manager.cleanup_group("session").await;
    assert!(!result.success);
    assert_eq!(result.cleaned, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(manager.resource_count(), 1);
}

#[tokio::test]
async fn test_handler_shutdown_releases_tracked_resources() {
    let (handler, _) = make_handler(test_config());
    let released = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&released);
    handler
        .cleanup_manager()
        .track_resource(
            ResourceKind::Connection,
            "search-index",
            move || {
                let r = Arc::clone(&r);
                async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            TrackOptions::default().critical(),
        )
        .await
        .unwrap();

    let report = handler.cleanup().await;
    assert_eq!(report.cleaned, 0);
    assert_eq!(released.load(Ordering::SeqCst), 0);

    let report = handler.shutdown().await;
    assert_eq!(report.cleaned, 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}
