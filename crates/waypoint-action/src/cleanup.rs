//! Resource tracking and cleanup.
//!
//! Every stage of the action pipeline registers the resources it acquires
//! (listeners, timers, subscriptions, observers, connections or arbitrary
//! handles) with a [`ResourceCleanupManager`]. Resources are released by id,
//! by kind, by group or in bulk, and a background sweep flags resources that
//! have not been touched for too long.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use waypoint_core::config::CleanupConfig;
use waypoint_core::events::{EventBus, SubscriptionId};
use waypoint_core::types::Timestamp;

use crate::error::CleanupError;
use crate::types::BoxFuture;

/// Kind of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    EventListener,
    Timer,
    Subscription,
    Observer,
    Connection,
    Custom,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::EventListener => write!(f, "event-listener"),
            ResourceKind::Timer => write!(f, "timer"),
            ResourceKind::Subscription => write!(f, "subscription"),
            ResourceKind::Observer => write!(f, "observer"),
            ResourceKind::Connection => write!(f, "connection"),
            ResourceKind::Custom => write!(f, "custom"),
        }
    }
}

/// Releases a resource. May be retried if it fails.
pub type CleanupTask = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Called once per resource flagged by a leak sweep.
pub type LeakCallback = Arc<dyn Fn(&ResourceInfo) + Send + Sync>;

/// Options for `track_resource`.
#[derive(Debug, Clone, Default)]
pub struct TrackOptions {
    /// Higher priorities are released first during bulk cleanup.
    pub priority: i32,
    /// Critical resources are skipped by bulk cleanup that respects the flag,
    /// and are never reported as leaks.
    pub critical: bool,
    /// Group to join. The group is created (non-atomic) if it does not exist.
    pub group: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

impl TrackOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

struct ResourceTracker {
    kind: ResourceKind,
    name: String,
    task: CleanupTask,
    created_at: Timestamp,
    last_accessed: Instant,
    metadata: Option<Map<String, Value>>,
    priority: i32,
    critical: bool,
    seq: u64,
}

impl ResourceTracker {
    fn info(&self, id: Uuid) -> ResourceInfo {
        ResourceInfo {
            id,
            kind: self.kind,
            name: self.name.clone(),
            created_at: self.created_at,
            idle_ms: self.last_accessed.elapsed().as_millis() as u64,
            priority: self.priority,
            critical: self.critical,
            metadata: self.metadata.clone(),
        }
    }
}

/// Snapshot of a tracked resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub name: String,
    pub created_at: Timestamp,
    /// Time since the resource was created or last accessed.
    pub idle_ms: u64,
    pub priority: i32,
    pub critical: bool,
    pub metadata: Option<Map<String, Value>>,
}

struct CleanupGroup {
    members: Vec<Uuid>,
    priority: i32,
    atomic: bool,
}

/// Outcome of releasing one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceCleanupOutcome {
    pub id: Uuid,
    pub name: String,
    pub success: bool,
    pub error: Option<CleanupError>,
}

/// Aggregated outcome of a bulk, kind or group cleanup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupResult {
    pub success: bool,
    pub cleaned: usize,
    pub failed: usize,
    pub results: Vec<ResourceCleanupOutcome>,
    pub duration_ms: f64,
}

impl CleanupResult {
    fn from_outcomes(results: Vec<ResourceCleanupOutcome>, started: Instant) -> Self {
        let cleaned = results.iter().filter(|r| r.success).count();
        let failed = results.len() - cleaned;
        Self {
            success: failed == 0,
            cleaned,
            failed,
            results,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// Error messages of every failed resource.
    pub fn errors(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.name, e)))
            .collect()
    }
}

/// Result of one leak sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeakReport {
    pub leaked: Vec<ResourceInfo>,
    pub total_resources: usize,
    /// The tracked-resource count exceeds the configured ceiling.
    pub over_limit: bool,
}

/// Counters kept by the cleanup manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupStatistics {
    pub tracked_resources: usize,
    pub total_tracked: u64,
    pub total_cleaned: u64,
    pub total_failed: u64,
    pub leaks_detected: u64,
    pub groups: usize,
    pub by_kind: BTreeMap<ResourceKind, usize>,
    pub leak_detection_running: bool,
    pub shut_down: bool,
}

#[derive(Default)]
struct Counters {
    total_tracked: u64,
    total_cleaned: u64,
    total_failed: u64,
    leaks_detected: u64,
}

struct LeakDetector {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

struct CleanupInner {
    config: CleanupConfig,
    resources: Mutex<HashMap<Uuid, ResourceTracker>>,
    groups: Mutex<HashMap<String, CleanupGroup>>,
    counters: Mutex<Counters>,
    on_leak: Mutex<Option<LeakCallback>>,
    detector: Mutex<Option<LeakDetector>>,
    shut_down: AtomicBool,
    next_seq: AtomicU64,
}

impl CleanupInner {
    fn detect_leaks(&self) -> LeakReport {
        let threshold = Duration::from_secs(self.config.leak_threshold_secs);
        let (leaked, total_resources) = {
            let resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
            let leaked: Vec<ResourceInfo> = resources
                .iter()
                .filter(|(_, r)| !r.critical && r.last_accessed.elapsed() > threshold)
                .map(|(id, r)| r.info(*id))
                .collect();
            (leaked, resources.len())
        };

        let over_limit = total_resources > self.config.max_resources;
        if over_limit {
            warn!(
                tracked = total_resources,
                limit = self.config.max_resources,
                "Tracked resource count exceeds limit"
            );
        }

        if !leaked.is_empty() {
            self.counters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .leaks_detected += leaked.len() as u64;

            let callback = self
                .on_leak
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for info in &leaked {
                warn!(
                    resource_id = %info.id,
                    kind = %info.kind,
                    name = %info.name,
                    idle_ms = info.idle_ms,
                    "Possible resource leak"
                );
                if let Some(callback) = &callback {
                    callback(info);
                }
            }
        }

        LeakReport {
            leaked,
            total_resources,
            over_limit,
        }
    }
}

/// Tracks resources and releases them on demand or at shutdown.
///
/// Cloning is cheap and every clone shares the same resource map.
#[derive(Clone)]
pub struct ResourceCleanupManager {
    inner: Arc<CleanupInner>,
}

impl fmt::Debug for ResourceCleanupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCleanupManager")
            .field("resources", &self.resource_count())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl ResourceCleanupManager {
    /// Create a manager. Leak detection is not started until
    /// [`start_leak_detection`](Self::start_leak_detection) is called.
    pub fn new(config: CleanupConfig) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                config,
                resources: Mutex::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                on_leak: Mutex::new(None),
                detector: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Register a resource and its cleanup task.
    ///
    /// On a shut-down manager the task runs immediately and
    /// `CleanupError::ShutDown` is returned.
    pub async fn track_resource<F, Fut>(
        &self,
        kind: ResourceKind,
        name: impl Into<String>,
        cleanup: F,
        options: TrackOptions,
    ) -> Result<Uuid, CleanupError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = name.into();
        let task: CleanupTask =
            Arc::new(move || -> BoxFuture<'static, Result<(), String>> { Box::pin(cleanup()) });

        if self.is_shut_down() {
            if let Err(e) = task().await {
                warn!(name = %name, error = %e, "Cleanup of late resource failed");
            }
            return Err(CleanupError::ShutDown);
        }

        let id = Uuid::new_v4();
        let tracker = ResourceTracker {
            kind,
            name,
            task,
            created_at: Timestamp::now(),
            last_accessed: Instant::now(),
            metadata: options.metadata,
            priority: options.priority,
            critical: options.critical,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        debug!(resource_id = %id, kind = %tracker.kind, name = %tracker.name, "Tracking resource");

        let count = {
            let mut resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
            resources.insert(id, tracker);
            resources.len()
        };
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .total_tracked += 1;

        if count > self.inner.config.max_resources {
            warn!(
                tracked = count,
                limit = self.inner.config.max_resources,
                "Tracked resource count exceeds limit"
            );
        }

        if let Some(group) = options.group {
            self.inner
                .groups
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(group)
                .or_insert_with(|| CleanupGroup {
                    members: Vec::new(),
                    priority: 0,
                    atomic: false,
                })
                .members
                .push(id);
        }

        Ok(id)
    }

    /// Track an event bus subscription; cleanup unsubscribes it.
    pub async fn track_event_listener(
        &self,
        bus: Arc<dyn EventBus>,
        subscription: SubscriptionId,
        name: impl Into<String>,
        options: TrackOptions,
    ) -> Result<Uuid, CleanupError> {
        self.track_resource(
            ResourceKind::EventListener,
            name,
            move || {
                if !bus.unsubscribe(subscription) {
                    debug!(subscription_id = %subscription, "Subscription already removed");
                }
                std::future::ready(Ok(()))
            },
            options,
        )
        .await
    }

    /// Track a spawned task; cleanup aborts it.
    pub async fn track_timer<T>(
        &self,
        handle: &JoinHandle<T>,
        name: impl Into<String>,
        options: TrackOptions,
    ) -> Result<Uuid, CleanupError> {
        let abort = handle.abort_handle();
        self.track_resource(
            ResourceKind::Timer,
            name,
            move || {
                abort.abort();
                std::future::ready(Ok(()))
            },
            options,
        )
        .await
    }

    /// Track a subscription released by a synchronous closure.
    pub async fn track_subscription<F>(
        &self,
        name: impl Into<String>,
        unsubscribe: F,
        options: TrackOptions,
    ) -> Result<Uuid, CleanupError>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.track_resource(
            ResourceKind::Subscription,
            name,
            move || std::future::ready(unsubscribe()),
            options,
        )
        .await
    }

    /// Track an observer released by a synchronous closure.
    pub async fn track_observer<F>(
        &self,
        name: impl Into<String>,
        disconnect: F,
        options: TrackOptions,
    ) -> Result<Uuid, CleanupError>
    where
        F: Fn() -> Result<(), String> + Send + Sync + 'static,
    {
        self.track_resource(
            ResourceKind::Observer,
            name,
            move || std::future::ready(disconnect()),
            options,
        )
        .await
    }

    /// Refresh a resource's last-accessed time. Returns `false` if unknown.
    pub fn access_resource(&self, id: Uuid) -> bool {
        match self
            .inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&id)
        {
            Some(resource) => {
                resource.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, id: Uuid) -> bool {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn resource_count(&self) -> usize {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn resource_info(&self, id: Uuid) -> Option<ResourceInfo> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|r| r.info(id))
    }

    /// Release one resource.
    ///
    /// Returns `true` if the cleanup task succeeded and the resource was
    /// removed. Unknown ids and failed tasks return `false`; a failed
    /// resource stays tracked so it can be retried.
    pub async fn cleanup_resource(&self, id: Uuid) -> bool {
        self.release(id).await.success
    }

    /// Release every resource of one kind.
    pub async fn cleanup_by_kind(&self, kind: ResourceKind) -> CleanupResult {
        let started = Instant::now();
        let ids = self.ordered_ids(|r| r.kind == kind);
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.release(id).await);
        }
        self.prune_groups();
        CleanupResult::from_outcomes(results, started)
    }

    /// Create (or reconfigure) a named group.
    pub fn create_group(&self, name: impl Into<String>, priority: i32, atomic: bool) {
        let name = name.into();
        let mut groups = self.inner.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups.entry(name).or_insert_with(|| CleanupGroup {
            members: Vec::new(),
            priority,
            atomic,
        });
        group.priority = priority;
        group.atomic = atomic;
    }

    /// Add a tracked resource to an existing group.
    pub fn add_to_group(&self, group: &str, id: Uuid) -> bool {
        if !self.is_tracked(id) {
            return false;
        }
        let mut groups = self.inner.groups.lock().unwrap_or_else(|e| e.into_inner());
        match groups.get_mut(group) {
            Some(g) => {
                if !g.members.contains(&id) {
                    g.members.push(id);
                }
                true
            }
            None => false,
        }
    }

    /// Group names, highest priority first.
    pub fn group_names(&self) -> Vec<String> {
        let groups = self.inner.groups.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<(&String, i32)> = groups.iter().map(|(n, g)| (n, g.priority)).collect();
        names.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        names.into_iter().map(|(n, _)| n.clone()).collect()
    }

    /// Stop tracking a group and its members without running their cleanup
    /// tasks. Returns how many resources were dropped.
    ///
    /// For owners that have already released the resources themselves and
    /// cannot await, e.g. from a `Drop` impl.
    pub fn forget_group(&self, group_name: &str) -> usize {
        let mut resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
        let mut groups = self.inner.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = groups.remove(group_name) else {
            return 0;
        };
        let forgotten = group
            .members
            .iter()
            .filter(|id| resources.remove(id).is_some())
            .count();
        if forgotten > 0 {
            debug!(group = %group_name, resources = forgotten, "Group forgotten without cleanup");
        }
        forgotten
    }

    /// Release every member of a group, then delete the group.
    ///
    /// Atomic groups run their members in order and stop at the first
    /// failure; in that case no member is removed and every member is
    /// reported failed. Non-atomic groups release each member independently.
    pub async fn cleanup_group(&self, group_name: &str) -> CleanupResult {
        let started = Instant::now();
        let Some(group) = self
            .inner
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(group_name)
        else {
            debug!(group = %group_name, "Cleanup requested for unknown group");
            return CleanupResult::from_outcomes(vec![], started);
        };

        if !group.atomic {
            let mut results = Vec::with_capacity(group.members.len());
            for id in group.members {
                if self.is_tracked(id) {
                    results.push(self.release(id).await);
                }
            }
            return CleanupResult::from_outcomes(results, started);
        }

        let members: Vec<(Uuid, String, CleanupTask)> = {
            let resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
            group
                .members
                .iter()
                .filter_map(|id| {
                    resources
                        .get(id)
                        .map(|r| (*id, r.name.clone(), Arc::clone(&r.task)))
                })
                .collect()
        };

        let mut failure: Option<(Uuid, String)> = None;
        for (id, _, task) in &members {
            if let Err(e) = task().await {
                warn!(group = %group_name, resource_id = %id, error = %e, "Atomic group cleanup aborted");
                failure = Some((*id, e));
                break;
            }
        }

        let results: Vec<ResourceCleanupOutcome> = match failure {
            None => {
                let mut resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
                members
                    .into_iter()
                    .map(|(id, name, _)| {
                        resources.remove(&id);
                        ResourceCleanupOutcome {
                            id,
                            name,
                            success: true,
                            error: None,
                        }
                    })
                    .collect()
            }
            Some((failed_id, reason)) => members
                .into_iter()
                .map(|(id, name, _)| {
                    let error = if id == failed_id {
                        reason.clone()
                    } else {
                        format!("atomic group '{}' aborted: {}", group_name, reason)
                    };
                    ResourceCleanupOutcome {
                        id,
                        name,
                        success: false,
                        error: Some(CleanupError::TaskFailed(error)),
                    }
                })
                .collect(),
        };

        self.record(&results);
        CleanupResult::from_outcomes(results, started)
    }

    /// Release every resource, highest priority first.
    ///
    /// With `respect_critical`, critical resources are left tracked.
    pub async fn cleanup_all(&self, respect_critical: bool) -> CleanupResult {
        let started = Instant::now();
        let ids = self.ordered_ids(|r| !(respect_critical && r.critical));
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.release(id).await);
        }
        self.prune_groups();

        let result = CleanupResult::from_outcomes(results, started);
        info!(
            cleaned = result.cleaned,
            failed = result.failed,
            "Bulk resource cleanup finished"
        );
        result
    }

    /// Release everything and refuse further tracking. Idempotent; later
    /// calls return an empty result.
    pub async fn shutdown(&self) -> CleanupResult {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return CleanupResult {
                success: true,
                ..CleanupResult::default()
            };
        }
        self.stop_leak_detection();

        let result = self.cleanup_all(false).await;

        let remaining = {
            let mut resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
            let count = resources.len();
            resources.clear();
            count
        };
        if remaining > 0 {
            warn!(remaining, "Force-removed resources whose cleanup failed");
        }
        self.inner
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        result
    }

    /// Register the callback invoked for each flagged resource.
    pub fn set_leak_callback<F>(&self, callback: F)
    where
        F: Fn(&ResourceInfo) + Send + Sync + 'static,
    {
        *self.inner.on_leak.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Run one leak sweep now.
    pub fn detect_leaks(&self) -> LeakReport {
        self.inner.detect_leaks()
    }

    /// Start the periodic leak sweep.
    ///
    /// Returns `false` if detection is disabled, already running, the
    /// manager is shut down, or there is no tokio runtime.
    pub fn start_leak_detection(&self) -> bool {
        if !self.inner.config.leak_detection || self.is_shut_down() {
            return false;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("Leak detection requires a tokio runtime");
            return false;
        }

        let mut detector = self.inner.detector.lock().unwrap_or_else(|e| e.into_inner());
        if detector.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return false;
        }

        let period = Duration::from_secs(self.inner.config.leak_check_interval_secs.max(1));
        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let weak: Weak<CleanupInner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.detect_leaks();
                    }
                    _ = signal.notified() => break,
                }
            }
            debug!("Leak detection stopped");
        });

        *detector = Some(LeakDetector { handle, shutdown });
        debug!(interval_secs = period.as_secs(), "Leak detection started");
        true
    }

    /// Stop the periodic leak sweep. Returns `false` if it was not running.
    pub fn stop_leak_detection(&self) -> bool {
        match self
            .inner
            .detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            Some(detector) => {
                detector.shutdown.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn get_statistics(&self) -> CleanupStatistics {
        let (tracked_resources, by_kind) = {
            let resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
            let mut by_kind = BTreeMap::new();
            for r in resources.values() {
                *by_kind.entry(r.kind).or_insert(0) += 1;
            }
            (resources.len(), by_kind)
        };
        let groups = self
            .inner
            .groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let leak_detection_running = self
            .inner
            .detector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished());
        let counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());

        CleanupStatistics {
            tracked_resources,
            total_tracked: counters.total_tracked,
            total_cleaned: counters.total_cleaned,
            total_failed: counters.total_failed,
            leaks_detected: counters.leaks_detected,
            groups,
            by_kind,
            leak_detection_running,
            shut_down: self.is_shut_down(),
        }
    }

    /// Run one resource's task; remove it on success.
    async fn release(&self, id: Uuid) -> ResourceCleanupOutcome {
        let entry = self
            .inner
            .resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|r| (r.name.clone(), Arc::clone(&r.task)));

        let Some((name, task)) = entry else {
            return ResourceCleanupOutcome {
                id,
                name: String::new(),
                success: false,
                error: Some(CleanupError::NotTracked(id)),
            };
        };

        let outcome = match task().await {
            Ok(()) => {
                self.inner
                    .resources
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                debug!(resource_id = %id, name = %name, "Resource cleaned up");
                ResourceCleanupOutcome {
                    id,
                    name,
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                warn!(resource_id = %id, name = %name, error = %e, "Resource cleanup failed");
                ResourceCleanupOutcome {
                    id,
                    name,
                    success: false,
                    error: Some(CleanupError::TaskFailed(e)),
                }
            }
        };
        self.record(std::slice::from_ref(&outcome));
        outcome
    }

    fn record(&self, results: &[ResourceCleanupOutcome]) {
        let mut counters = self.inner.counters.lock().unwrap_or_else(|e| e.into_inner());
        for result in results {
            if result.success {
                counters.total_cleaned += 1;
            } else {
                counters.total_failed += 1;
            }
        }
    }

    /// Ids matching `filter`, highest priority first, then oldest first.
    fn ordered_ids(&self, filter: impl Fn(&ResourceTracker) -> bool) -> Vec<Uuid> {
        let resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<(Uuid, i32, u64)> = resources
            .iter()
            .filter(|(_, r)| filter(r))
            .map(|(id, r)| (*id, r.priority, r.seq))
            .collect();
        selected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.2.cmp(&b.2)));
        selected.into_iter().map(|(id, _, _)| id).collect()
    }

    /// Drop group members that are no longer tracked, and empty groups.
    fn prune_groups(&self) {
        let resources = self.inner.resources.lock().unwrap_or_else(|e| e.into_inner());
        let mut groups = self.inner.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups.retain(|_, group| {
            group.members.retain(|id| resources.contains_key(id));
            !group.members.is_empty()
        });
    }
}
