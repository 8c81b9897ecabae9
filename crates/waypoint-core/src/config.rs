use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WaypointError};
use crate::types::{ErrorStrategy, NavigationTarget};

/// Top-level configuration for Waypoint.
///
/// Each section corresponds to one component of the action pipeline.
/// Unknown keys are rejected at load time rather than silently ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WaypointConfig {
    pub general: GeneralConfig,
    pub handler: HandlerConfig,
    pub interceptor: InterceptorConfig,
    pub context: ContextConfig,
    pub cleanup: CleanupConfig,
}

impl WaypointConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WaypointConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| WaypointError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Name recorded as `createdBy` in context audit records.
    pub actor: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            actor: "action-handler".to_string(),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandlerConfig {
    /// Admission ceiling for in-flight actions. Values below 1 are treated as 1.
    pub max_concurrent_actions: usize,
    pub error_strategy: ErrorStrategy,
    /// Track and release per-action resources as soon as the action finishes.
    pub auto_cleanup: bool,
    /// Publish `action:*` lifecycle events on the event bus.
    pub emit_events: bool,
    /// Advisory callback timeout, enforced by the callback executor.
    pub timeout_ms: Option<u64>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: 5,
            error_strategy: ErrorStrategy::Callback,
            auto_cleanup: true,
            emit_events: true,
            timeout_ms: None,
        }
    }
}

/// Interception and navigation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterceptorConfig {
    /// Global prevention: every action is vetoed before the chain runs.
    pub prevent_default: bool,
    /// Route results that carry a URL through the navigation pipeline.
    pub intercept_navigation: bool,
    pub default_target: NavigationTarget,
    /// Suppress default navigation when no custom navigation handler is set.
    pub prevent_default_navigation: bool,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            prevent_default: false,
            intercept_navigation: true,
            default_target: NavigationTarget::SameTab,
            prevent_default_navigation: false,
        }
    }
}

/// Context preservation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Maximum preserved contexts kept for lookup; oldest evicted first.
    pub history_size: usize,
    /// Ceiling on the serialized context size, in bytes.
    pub max_context_size: usize,
    pub validate: bool,
    pub sanitize: bool,
    pub secure: bool,
    pub track: bool,
    pub calculate_size: bool,
    pub include_performance: bool,
    pub include_user: bool,
    pub include_source_details: bool,
    pub security: SecurityPolicyConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            history_size: 1000,
            max_context_size: 1024 * 1024,
            validate: true,
            sanitize: true,
            secure: true,
            track: true,
            calculate_size: true,
            include_performance: false,
            include_user: true,
            include_source_details: true,
            security: SecurityPolicyConfig::default(),
        }
    }
}

/// Trust and permission policy applied when a context is secured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityPolicyConfig {
    /// Origin stamped on contexts created by this process.
    pub origin: String,
    /// Origins considered trusted. Empty means every origin is trusted;
    /// `"*"` matches any origin.
    pub allowed_origins: Vec<String>,
    /// Permissions every secured context carries in addition to the user's.
    pub required_permissions: Vec<String>,
    /// Dotted field paths removed during sanitization.
    pub restricted_fields: Vec<String>,
}

impl Default for SecurityPolicyConfig {
    fn default() -> Self {
        Self {
            origin: "app://local".to_string(),
            allowed_origins: vec!["app://local".to_string()],
            required_permissions: vec![],
            restricted_fields: vec![],
        }
    }
}

/// Resource tracking and leak detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanupConfig {
    pub leak_detection: bool,
    pub leak_check_interval_secs: u64,
    /// Age of `last_accessed` after which a non-critical resource is flagged.
    pub leak_threshold_secs: u64,
    /// Tracked-resource count above which a warning is logged.
    pub max_resources: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            leak_detection: true,
            leak_check_interval_secs: 60,
            leak_threshold_secs: 300,
            max_resources: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_temp_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = WaypointConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.actor, "action-handler");
        assert_eq!(config.handler.max_concurrent_actions, 5);
        assert_eq!(config.handler.error_strategy, ErrorStrategy::Callback);
        assert!(config.handler.auto_cleanup);
        assert!(config.handler.timeout_ms.is_none());
        assert!(!config.interceptor.prevent_default);
        assert_eq!(config.interceptor.default_target, NavigationTarget::SameTab);
        assert_eq!(config.context.history_size, 1000);
        assert_eq!(config.context.max_context_size, 1_048_576);
        assert_eq!(config.cleanup.leak_check_interval_secs, 60);
        assert_eq!(config.cleanup.leak_threshold_secs, 300);
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
log_level = "debug"
actor = "search-page"

[handler]
max_concurrent_actions = 2
error_strategy = "throw"
timeout_ms = 1500

[interceptor]
prevent_default = true
default_target = "_blank"

[context]
history_size = 10

[context.security]
allowed_origins = ["https://search.example.com"]
required_permissions = ["navigate"]

[cleanup]
leak_threshold_secs = 30
"#;
        let file = create_temp_config(content);
        let config = WaypointConfig::load(file.path()).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.actor, "search-page");
        assert_eq!(config.handler.max_concurrent_actions, 2);
        assert_eq!(config.handler.error_strategy, ErrorStrategy::Throw);
        assert_eq!(config.handler.timeout_ms, Some(1500));
        assert!(config.interceptor.prevent_default);
        assert_eq!(config.interceptor.default_target, NavigationTarget::NewTab);
        assert_eq!(config.context.history_size, 10);
        assert_eq!(
            config.context.security.allowed_origins,
            vec!["https://search.example.com"]
        );
        assert_eq!(config.context.security.required_permissions, vec!["navigate"]);
        // Untouched fields keep their defaults
        assert_eq!(config.context.security.origin, "app://local");
        assert_eq!(config.cleanup.leak_threshold_secs, 30);
        assert_eq!(config.cleanup.max_resources, 1000);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let content = r#"
[handler]
max_concurrent = 3
"#;
        let file = create_temp_config(content);
        let err = WaypointConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, WaypointError::Config(_)));
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let file = create_temp_config("[theme]\ncolor = \"dark\"\n");
        assert!(WaypointConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        assert!(WaypointConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = WaypointConfig::load_or_default(Path::new("/does/not/exist/waypoint.toml"));
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.handler.max_concurrent_actions, 5);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = WaypointConfig::load(file.path()).unwrap();
        assert_eq!(config.context.history_size, 1000);
        assert!(config.cleanup.leak_detection);
    }

    #[test]
    fn test_save_creates_parent_dirs_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("waypoint.toml");

        let mut config = WaypointConfig::default();
        config.handler.max_concurrent_actions = 9;
        config.handler.timeout_ms = Some(250);
        config.save(&path).unwrap();

        let reloaded = WaypointConfig::load(&path).unwrap();
        assert_eq!(reloaded.handler.max_concurrent_actions, 9);
        assert_eq!(reloaded.handler.timeout_ms, Some(250));
        assert_eq!(reloaded.interceptor.default_target, NavigationTarget::SameTab);
    }
}
