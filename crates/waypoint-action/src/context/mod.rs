//! Context preservation.
//!
//! Builds the provenance snapshot for an action, validates and sanitizes it,
//! wraps it into a secured and audited context, and keeps a bounded history
//! of preserved contexts for later lookup.

pub mod sanitize;
pub mod validation;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;
use waypoint_core::config::ContextConfig;
use waypoint_core::types::{SearchResult, Timestamp};

use crate::error::ContextError;
use crate::types::{
    ActionContext, AuditRecord, ContextPreservationResult, ContextUpdate, EnrichmentConfig,
    PerformanceMetrics, PreserveOptions, SearchInfo, SecureActionContext, SecurityRecord,
    SourceInfo, UserInfo, ValidationRecord,
};
use validation::{ValidationOutcome, ValidationRule};

pub const RESTRICTION_NO_USER: &str = "no-user-context";
pub const RESTRICTION_UNTRUSTED: &str = "untrusted-origin";
pub const RESTRICTION_UNSECURED: &str = "unsecured";

/// Custom enricher: returns entries merged into the context's custom map.
pub type ContextEnricher =
    Arc<dyn Fn(&ActionContext, &SearchResult) -> Result<Map<String, Value>, String> + Send + Sync>;

/// Bounded, insertion-ordered store of preserved contexts.
struct ContextHistory {
    entries: HashMap<Uuid, SecureActionContext>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl ContextHistory {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, context: SecureActionContext) {
        let id = context.context_id();
        if self.entries.insert(id, context).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                debug!(context_id = %oldest, "Evicted oldest preserved context");
            }
        }
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.order.clear();
        count
    }
}

/// Builds, secures and remembers action contexts.
pub struct ContextPreserver {
    config: ContextConfig,
    actor: String,
    history: Mutex<ContextHistory>,
    enrichers: Mutex<Vec<(String, ContextEnricher)>>,
    rules: Mutex<Vec<(String, ValidationRule)>>,
}

impl fmt::Debug for ContextPreserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPreserver")
            .field("actor", &self.actor)
            .field("history_len", &self.history_len())
            .finish_non_exhaustive()
    }
}

impl ContextPreserver {
    /// Create a preserver. `actor` is recorded as the audit `created_by`.
    pub fn new(config: ContextConfig, actor: impl Into<String>) -> Self {
        let history = ContextHistory::new(config.history_size);
        Self {
            config,
            actor: actor.into(),
            history: Mutex::new(history),
            enrichers: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Register a custom enricher run by `create_context`.
    pub fn add_enricher<F>(&self, name: impl Into<String>, enricher: F)
    where
        F: Fn(&ActionContext, &SearchResult) -> Result<Map<String, Value>, String>
            + Send
            + Sync
            + 'static,
    {
        self.enrichers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), Arc::new(enricher)));
    }

    /// Register a custom validation rule run by `preserve_context`.
    pub fn add_validation_rule<F>(&self, name: impl Into<String>, rule: F)
    where
        F: Fn(&Value) -> ValidationOutcome + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), Arc::new(rule)));
    }

    /// Build the base context for a selected result.
    ///
    /// Search fields come from the result's metadata (`totalResults`,
    /// `processingTime`, `resultIndex`, `page`, `filters`). Enricher failures
    /// are logged and skipped.
    pub fn create_context(
        &self,
        result: &SearchResult,
        query: &str,
        source: Option<&SourceInfo>,
        enrichment: &EnrichmentConfig,
    ) -> ActionContext {
        let started = Instant::now();

        let source = match source {
            Some(info) if enrichment.include_source_details => info.clone(),
            Some(info) => SourceInfo::new(info.source_type.clone()),
            None => SourceInfo::default(),
        };

        let processing_time = result
            .meta("processingTime")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let search = SearchInfo {
            total_results: result
                .meta("totalResults")
                .and_then(Value::as_u64)
                .unwrap_or(1),
            processing_time,
            result_index: result
                .meta("resultIndex")
                .or_else(|| result.meta("index"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            page: result.meta("page").and_then(Value::as_u64),
            filters: result
                .meta("filters")
                .and_then(Value::as_object)
                .cloned(),
        };

        let user = if enrichment.include_user {
            enrichment.user.clone()
        } else {
            None
        };

        let mut context = ActionContext {
            query: query.to_string(),
            timestamp: Timestamp::now(),
            source,
            search,
            performance: None,
            user,
            custom: enrichment.custom.clone(),
        };

        let enrichers = self
            .enrichers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (name, enricher) in enrichers {
            match enricher(&context, result) {
                Ok(extra) if !extra.is_empty() => {
                    context.custom.get_or_insert_with(Map::new).extend(extra);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(enricher = %name, result_id = %result.id, error = %e, "Context enricher failed");
                }
            }
        }

        if enrichment.include_performance {
            context.performance = Some(PerformanceMetrics {
                context_creation_us: started.elapsed().as_micros() as u64,
                search_processing_time_ms: processing_time,
            });
        }

        context
    }

    /// Validate, sanitize, secure and record a typed context.
    pub fn preserve_context(
        &self,
        context: &ActionContext,
        options: &PreserveOptions,
    ) -> ContextPreservationResult {
        match serde_json::to_value(context) {
            Ok(value) => self.preserve_value(value, options),
            Err(e) => failure(
                ContextError::Serialization(e.to_string()),
                vec![],
                0,
                Instant::now(),
            ),
        }
    }

    /// Validate, sanitize, secure and record an untyped context.
    ///
    /// The value is owned, so the preserved context never aliases caller
    /// data. Nothing is recorded unless every enabled step succeeds.
    pub fn preserve_value(
        &self,
        mut value: Value,
        options: &PreserveOptions,
    ) -> ContextPreservationResult {
        let started = Instant::now();
        let mut warnings = Vec::new();
        let mut chain = vec!["created".to_string()];

        // Stays false when validation is skipped.
        let mut validation = ValidationRecord::default();
        if options.validate {
            let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let outcome = validation::validate(&value, &rules);
            warnings.extend(outcome.warnings.iter().cloned());
            if !outcome.valid {
                debug!(errors = ?outcome.errors, "Context validation failed");
                return failure(ContextError::Validation(outcome.errors), warnings, 0, started);
            }
            validation.is_valid = true;
            validation.warnings = outcome.warnings;
            chain.push("validated".to_string());
        } else {
            warnings.push("validation skipped".to_string());
        }

        if options.sanitize {
            let report = sanitize::sanitize_context(&mut value, &self.config.security.restricted_fields);
            for field in &report.removed_fields {
                warnings.push(format!("restricted field removed: {}", field));
            }
            for field in &report.protected_fields {
                warn!(field = %field, "Restricted field is required and was kept");
                warnings.push(format!("restricted field kept, it is required: {}", field));
            }
            validation.sanitized = report.modified();
            chain.push("sanitized".to_string());
        }

        let mut size_bytes = 0;
        let mut size_estimated = false;
        if options.calculate_size {
            (size_bytes, size_estimated) = measure_size(&value);
            if size_bytes > self.config.max_context_size {
                return failure(
                    ContextError::TooLarge {
                        size: size_bytes,
                        limit: self.config.max_context_size,
                    },
                    warnings,
                    size_bytes,
                    started,
                );
            }
        }

        let context: ActionContext = match serde_json::from_value(value) {
            Ok(context) => context,
            Err(e) => {
                return failure(
                    ContextError::Serialization(e.to_string()),
                    warnings,
                    size_bytes,
                    started,
                );
            }
        };

        let origin = options
            .origin
            .clone()
            .unwrap_or_else(|| self.config.security.origin.clone());
        let security = if options.secure {
            chain.push("secured".to_string());
            self.evaluate_security(&context, origin)
        } else {
            SecurityRecord {
                trusted: false,
                origin,
                permissions: vec![],
                restrictions: vec![RESTRICTION_UNSECURED.to_string()],
            }
        };

        if options.track {
            chain.push("tracked".to_string());
        }

        let secured = SecureActionContext {
            context,
            validation,
            security,
            audit: AuditRecord {
                context_id: Uuid::new_v4(),
                created_by: self.actor.clone(),
                created_at: Timestamp::now(),
                modified_by: None,
                modified_at: None,
                chain,
            },
        };

        if options.track {
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(secured.clone());
        }

        debug!(
            context_id = %secured.context_id(),
            trusted = secured.security.trusted,
            size_bytes,
            "Context preserved"
        );

        ContextPreservationResult {
            success: true,
            context: Some(secured),
            error: None,
            warnings,
            size_bytes,
            size_estimated,
            processing_time_ms: elapsed_ms(started),
        }
    }

    /// Look up a preserved context by id.
    pub fn get_preserved_context(&self, context_id: Uuid) -> Option<SecureActionContext> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .get(&context_id)
            .cloned()
    }

    /// Apply field updates to a preserved context and stamp the audit record.
    pub fn update_context(
        &self,
        context_id: Uuid,
        update: ContextUpdate,
        modified_by: &str,
    ) -> Result<SecureActionContext, ContextError> {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let secured = history
            .entries
            .get_mut(&context_id)
            .ok_or(ContextError::NotFound(context_id))?;

        if let Some(query) = update.query {
            secured.context.query = if self.config.sanitize {
                sanitize::sanitize_str(&query).unwrap_or(query)
            } else {
                query
            };
        }
        if let Some(user) = update.user {
            secured.security.restrictions.retain(|r| r != RESTRICTION_NO_USER);
            merge_permissions(&mut secured.security.permissions, &user);
            secured.context.user = Some(user);
        }
        if let Some(performance) = update.performance {
            secured.context.performance = Some(performance);
        }
        if let Some(mut custom) = update.custom {
            if self.config.sanitize {
                for value in custom.values_mut() {
                    sanitize::sanitize_value(value);
                }
            }
            secured.context.custom.get_or_insert_with(Map::new).extend(custom);
        }

        secured.audit.modified_by = Some(modified_by.to_string());
        secured.audit.modified_at = Some(Timestamp::now());
        secured.audit.chain.push("updated".to_string());

        Ok(secured.clone())
    }

    /// Return a copy of `context` with extra custom entries merged in.
    pub fn enrich_context(
        &self,
        context: &ActionContext,
        extra: Map<String, Value>,
        sanitize: bool,
    ) -> ActionContext {
        let mut enriched = context.clone();
        enriched.custom.get_or_insert_with(Map::new).extend(extra);

        if sanitize {
            if let Some(cleaned) = sanitize::sanitize_str(&enriched.query) {
                enriched.query = cleaned;
            }
            if let Some(custom) = enriched.custom.as_mut() {
                for value in custom.values_mut() {
                    sanitize::sanitize_value(value);
                }
            }
        }

        enriched
    }

    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Drop every preserved context. Returns how many were removed.
    pub fn clear_history(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear()
    }

    fn evaluate_security(&self, context: &ActionContext, origin: String) -> SecurityRecord {
        let policy = &self.config.security;
        let trusted = policy.allowed_origins.is_empty()
            || policy
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || *allowed == origin);

        let mut permissions = Vec::new();
        if let Some(user) = &context.user {
            merge_permissions(&mut permissions, user);
        }
        for required in &policy.required_permissions {
            if !permissions.contains(required) {
                permissions.push(required.clone());
            }
        }

        let mut restrictions = Vec::new();
        if context.user.is_none() {
            restrictions.push(RESTRICTION_NO_USER.to_string());
        }
        if !trusted {
            restrictions.push(RESTRICTION_UNTRUSTED.to_string());
        }

        SecurityRecord {
            trusted,
            origin,
            permissions,
            restrictions,
        }
    }
}

fn merge_permissions(permissions: &mut Vec<String>, user: &UserInfo) {
    for permission in user.permissions.iter().flatten() {
        if !permissions.contains(permission) {
            permissions.push(permission.clone());
        }
    }
}

/// Serialized size in bytes, and whether it was estimated.
///
/// The estimate counts UTF-16 code units of the debug rendering, two bytes
/// each; it is an approximation used only when serialization fails. A
/// `serde_json::Value` always serializes, so preserved contexts are always
/// measured exactly.
pub fn measure_size<T>(value: &T) -> (usize, bool)
where
    T: Serialize + fmt::Debug + ?Sized,
{
    match serde_json::to_vec(value) {
        Ok(bytes) => (bytes.len(), false),
        Err(e) => {
            warn!(error = %e, "Context serialization failed, estimating size");
            (format!("{:?}", value).encode_utf16().count() * 2, true)
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn failure(
    error: ContextError,
    warnings: Vec<String>,
    size_bytes: usize,
    started: Instant,
) -> ContextPreservationResult {
    ContextPreservationResult {
        success: false,
        context: None,
        error: Some(error),
        warnings,
        size_bytes,
        size_estimated: false,
        processing_time_ms: elapsed_ms(started),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn preserver() -> ContextPreserver {
        ContextPreserver::new(ContextConfig::default(), "test-suite")
    }

    fn result() -> SearchResult {
        SearchResult::new("r1", "Rust async book")
            .with_url("https://rust-lang.github.io/async-book/")
            .with_metadata("totalResults", json!(120))
            .with_metadata("processingTime", json!(8.5))
            .with_metadata("resultIndex", json!(2))
            .with_metadata("page", json!(1))
    }

    fn full_enrichment() -> EnrichmentConfig {
        EnrichmentConfig {
            include_performance: true,
            include_user: true,
            include_source_details: true,
            user: Some(UserInfo::new("u1").with_permissions(["navigate"])),
            custom: None,
        }
    }

    #[test]
    fn test_create_context_reads_search_metadata() {
        let p = preserver();
        let source = SourceInfo::new("instant-search").with_name("docs").with_version("2");
        let ctx = p.create_context(&result(), "async", Some(&source), &full_enrichment());

        assert_eq!(ctx.query, "async");
        assert_eq!(ctx.search.total_results, 120);
        assert_eq!(ctx.search.result_index, 2);
        assert_eq!(ctx.search.page, Some(1));
        assert!((ctx.search.processing_time - 8.5).abs() < f64::EPSILON);
        assert_eq!(ctx.source, source);
        assert_eq!(ctx.user.as_ref().unwrap().id, "u1");
        assert!(ctx.performance.is_some());
    }

    #[test]
    fn test_create_context_without_enrichment_flags() {
        let p = preserver();
        let source = SourceInfo::new("instant-search").with_name("docs");
        let enrichment = EnrichmentConfig {
            user: Some(UserInfo::new("u1")),
            ..EnrichmentConfig::default()
        };
        let ctx = p.create_context(&SearchResult::new("r", "t"), "q", Some(&source), &enrichment);

        assert_eq!(ctx.source, SourceInfo::new("instant-search"));
        assert!(ctx.user.is_none());
        assert!(ctx.performance.is_none());
        assert_eq!(ctx.search.total_results, 1);
        assert_eq!(ctx.search.result_index, 0);
    }

    #[test]
    fn test_failing_enricher_does_not_block_creation() {
        let p = preserver();
        p.add_enricher("broken", |_, _| Err("lookup service down".to_string()));
        p.add_enricher("title", |_, result| {
            let mut extra = Map::new();
            extra.insert("title".to_string(), json!(result.title));
            Ok(extra)
        });

        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());

        let custom = ctx.custom.unwrap();
        assert_eq!(custom["title"], "Rust async book");
        assert_eq!(custom.len(), 1);
    }

    #[test]
    fn test_preserve_valid_context() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &full_enrichment());
        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.error.is_none());
        assert!(outcome.size_bytes > 0);
        assert!(!outcome.size_estimated);

        let secured = outcome.context.unwrap();
        assert!(secured.validation.is_valid);
        assert!(secured.security.trusted);
        assert_eq!(secured.security.permissions, vec!["navigate"]);
        assert!(secured.security.restrictions.is_empty());
        assert_eq!(secured.audit.created_by, "test-suite");
        assert_eq!(
            secured.audit.chain,
            vec!["created", "validated", "sanitized", "secured", "tracked"]
        );
        assert_eq!(p.get_preserved_context(secured.context_id()), Some(secured));
    }

    #[test]
    fn test_context_ids_are_unique() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let outcome = p.preserve_context(&ctx, &PreserveOptions::default());
            assert!(seen.insert(outcome.context.unwrap().context_id()));
        }
    }

    #[test]
    fn test_invalid_context_is_not_recorded() {
        let p = preserver();
        let ctx = p.create_context(&result(), "", None, &EnrichmentConfig::default());
        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        assert!(!outcome.success);
        assert!(outcome.context.is_none());
        assert!(matches!(outcome.error, Some(ContextError::Validation(_))));
        assert_eq!(p.history_len(), 0);
    }

    #[test]
    fn test_non_numeric_timestamp_rejected() {
        let p = preserver();
        let value = json!({
            "query": "rust",
            "timestamp": "now",
            "source": {"type": "search"},
            "search": {"totalResults": 1, "processingTime": 0.0, "resultIndex": 0}
        });
        let outcome = p.preserve_value(value, &PreserveOptions::default());

        assert!(!outcome.success);
        assert_eq!(
            outcome.error,
            Some(ContextError::Validation(vec![
                "timestamp must be a number".to_string()
            ]))
        );
        assert_eq!(p.history_len(), 0);
    }

    #[test]
    fn test_custom_validation_rule_blocks_preservation() {
        let p = preserver();
        p.add_validation_rule("no-empty-custom", |ctx| {
            if ctx.get("custom").is_none() {
                ValidationOutcome::error("custom data required")
            } else {
                ValidationOutcome::ok()
            }
        });
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        assert_eq!(
            outcome.error,
            Some(ContextError::Validation(vec!["custom data required".to_string()]))
        );
    }

    #[test]
    fn test_sanitization_strips_markup() {
        let p = preserver();
        let enrichment = EnrichmentConfig {
            custom: Some(
                json!({"ref": "<a href='x'>link</a>", "next": "javascript:go()"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            ..EnrichmentConfig::default()
        };
        let ctx = p.create_context(&result(), "<script>rust</script>", None, &enrichment);
        let secured = p
            .preserve_context(&ctx, &PreserveOptions::default())
            .context
            .unwrap();

        assert!(secured.validation.sanitized);
        assert_eq!(secured.context.query, "rust");
        let custom = secured.context.custom.unwrap();
        assert_eq!(custom["ref"], "link");
        assert_eq!(custom["next"], "go()");
    }

    #[test]
    fn test_restricted_fields_removed_with_warning() {
        let mut config = ContextConfig::default();
        config.security.restricted_fields = vec!["user.sessionId".to_string()];
        let p = ContextPreserver::new(config, "test-suite");
        let enrichment = EnrichmentConfig {
            include_user: true,
            user: Some(UserInfo::new("u1").with_session("s-123")),
            ..EnrichmentConfig::default()
        };
        let ctx = p.create_context(&result(), "async", None, &enrichment);
        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        let secured = outcome.context.unwrap();
        assert!(secured.context.user.unwrap().session_id.is_none());
        assert_eq!(outcome.warnings, vec!["restricted field removed: user.sessionId"]);
    }

    #[test]
    fn test_oversized_context_rejected() {
        let mut config = ContextConfig::default();
        config.max_context_size = 256;
        let p = ContextPreserver::new(config, "test-suite");
        let enrichment = EnrichmentConfig {
            custom: Some(json!({"blob": "x".repeat(1024)}).as_object().cloned().unwrap()),
            ..EnrichmentConfig::default()
        };
        let ctx = p.create_context(&result(), "async", None, &enrichment);
        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        assert!(!outcome.success);
        match outcome.error {
            Some(ContextError::TooLarge { size, limit }) => {
                assert_eq!(limit, 256);
                assert!(size > 1024);
            }
            other => panic!("expected TooLarge, got {:?}", other),
        }
        assert_eq!(p.history_len(), 0);
    }

    #[test]
    fn test_untrusted_origin_and_required_permissions() {
        let mut config = ContextConfig::default();
        config.security.allowed_origins = vec!["https://search.example.com".to_string()];
        config.security.required_permissions = vec!["read".to_string(), "navigate".to_string()];
        let p = ContextPreserver::new(config, "test-suite");
        let ctx = p.create_context(&result(), "async", None, &full_enrichment());

        let options = PreserveOptions {
            origin: Some("https://evil.example.com".to_string()),
            ..PreserveOptions::default()
        };
        let secured = p.preserve_context(&ctx, &options).context.unwrap();

        assert!(!secured.security.trusted);
        assert_eq!(secured.security.origin, "https://evil.example.com");
        assert_eq!(secured.security.permissions, vec!["navigate", "read"]);
        assert_eq!(secured.security.restrictions, vec![RESTRICTION_UNTRUSTED]);
    }

    #[test]
    fn test_missing_user_restriction() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let secured = p
            .preserve_context(&ctx, &PreserveOptions::default())
            .context
            .unwrap();
        assert_eq!(secured.security.restrictions, vec![RESTRICTION_NO_USER]);
    }

    #[test]
    fn test_untracked_context_not_in_history() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let options = PreserveOptions {
            track: false,
            ..PreserveOptions::default()
        };
        let secured = p.preserve_context(&ctx, &options).context.unwrap();
        assert!(p.get_preserved_context(secured.context_id()).is_none());
        assert!(!secured.audit.chain.contains(&"tracked".to_string()));
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut config = ContextConfig::default();
        config.history_size = 3;
        let p = ContextPreserver::new(config, "test-suite");
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());

        let ids: Vec<Uuid> = (0..5)
            .map(|_| {
                p.preserve_context(&ctx, &PreserveOptions::default())
                    .context
                    .unwrap()
                    .context_id()
            })
            .collect();

        assert_eq!(p.history_len(), 3);
        assert!(p.get_preserved_context(ids[0]).is_none());
        assert!(p.get_preserved_context(ids[1]).is_none());
        assert!(p.get_preserved_context(ids[4]).is_some());
    }

    #[test]
    fn test_update_context_stamps_audit() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let id = p
            .preserve_context(&ctx, &PreserveOptions::default())
            .context
            .unwrap()
            .context_id();

        let mut custom = Map::new();
        custom.insert("clicked".to_string(), json!(true));
        let updated = p
            .update_context(
                id,
                ContextUpdate {
                    query: Some("<b>tokio</b>".to_string()),
                    user: Some(UserInfo::new("u2").with_permissions(["share"])),
                    custom: Some(custom),
                    ..ContextUpdate::default()
                },
                "reviewer",
            )
            .unwrap();

        assert_eq!(updated.context.query, "tokio");
        assert_eq!(updated.audit.modified_by.as_deref(), Some("reviewer"));
        assert!(updated.audit.modified_at.is_some());
        assert_eq!(updated.audit.chain.last().map(String::as_str), Some("updated"));
        assert!(updated.has_permission("share"));
        assert!(!updated.is_restricted(RESTRICTION_NO_USER));
        assert_eq!(updated.context.custom.unwrap()["clicked"], true);
        assert_eq!(p.get_preserved_context(id).unwrap().context.query, "tokio");
    }

    #[test]
    fn test_update_unknown_context() {
        let p = preserver();
        let id = Uuid::new_v4();
        let err = p
            .update_context(id, ContextUpdate::default(), "reviewer")
            .unwrap_err();
        assert_eq!(err, ContextError::NotFound(id));
    }

    #[test]
    fn test_enrich_context_merges_and_sanitizes() {
        let p = preserver();
        let ctx = p.create_context(&result(), "<i>async</i>", None, &EnrichmentConfig::default());
        let mut extra = Map::new();
        extra.insert("source_page".to_string(), json!("<b>home</b>"));

        let raw = p.enrich_context(&ctx, extra.clone(), false);
        assert_eq!(raw.custom.as_ref().unwrap()["source_page"], "<b>home</b>");
        assert_eq!(raw.query, "<i>async</i>");

        let clean = p.enrich_context(&ctx, extra, true);
        assert_eq!(clean.custom.as_ref().unwrap()["source_page"], "home");
        assert_eq!(clean.query, "async");
        // The original is untouched
        assert!(ctx.custom.is_none());
    }

    #[test]
    fn test_clear_history() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        p.preserve_context(&ctx, &PreserveOptions::default());
        p.preserve_context(&ctx, &PreserveOptions::default());
        assert_eq!(p.clear_history(), 2);
        assert_eq!(p.history_len(), 0);
    }

    #[test]
    fn test_measure_size_matches_serialized_length() {
        let value = json!({"query": "rust"});
        let (size, estimated) = measure_size(&value);
        assert_eq!(size, serde_json::to_vec(&value).unwrap().len());
        assert!(!estimated);
    }

    #[derive(Debug)]
    struct Opaque(&'static str);

    impl Serialize for Opaque {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    #[test]
    fn test_measure_size_estimates_when_serialization_fails() {
        let value = Opaque("socket");
        let (size, estimated) = measure_size(&value);
        assert!(estimated);
        // `Opaque("socket")` is 16 UTF-16 units.
        assert_eq!(size, 32);
    }

    #[test]
    fn test_skipped_validation_is_not_reported_valid() {
        let p = preserver();
        let ctx = p.create_context(&result(), "async", None, &EnrichmentConfig::default());
        let options = PreserveOptions {
            validate: false,
            ..PreserveOptions::default()
        };
        let outcome = p.preserve_context(&ctx, &options);

        assert!(outcome.success);
        assert!(outcome.warnings.contains(&"validation skipped".to_string()));
        let secured = outcome.context.unwrap();
        assert!(!secured.validation.is_valid);
        assert!(!secured.audit.chain.contains(&"validated".to_string()));
    }

    #[test]
    fn test_restricting_required_fields_keeps_them() {
        let mut config = ContextConfig::default();
        config.security.restricted_fields = vec!["user.id".to_string(), "query".to_string()];
        let p = ContextPreserver::new(config, "test-suite");
        let ctx = p.create_context(&result(), "async", None, &full_enrichment());

        let outcome = p.preserve_context(&ctx, &PreserveOptions::default());

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(
            outcome
                .warnings
                .iter()
                .filter(|w| w.starts_with("restricted field kept"))
                .count(),
            2
        );
        let secured = outcome.context.unwrap();
        assert_eq!(secured.context.query, "async");
        assert!(secured.context.user.is_some());
    }
}
