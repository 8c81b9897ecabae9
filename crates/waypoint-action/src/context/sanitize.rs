//! Context sanitization.
//!
//! Strips HTML-like tags and script-protocol prefixes from the query and
//! from every string inside the custom map, and removes restricted fields.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("Invalid HTML tag regex"));

static SCRIPT_PROTOCOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:javascript|vbscript)\s*:|data\s*:\s*text/html")
        .expect("Invalid script protocol regex")
});

/// What a sanitization pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Number of string values that were rewritten.
    pub strings_cleaned: usize,
    /// Restricted paths that were present and removed.
    pub removed_fields: Vec<String>,
    /// Restricted paths left in place because a context cannot exist
    /// without them.
    pub protected_fields: Vec<String>,
}

impl SanitizeReport {
    pub fn modified(&self) -> bool {
        self.strings_cleaned > 0 || !self.removed_fields.is_empty()
    }
}

/// Paths a context must keep to deserialize. Restricting them is a
/// configuration mistake; they are reported and left untouched.
pub const PROTECTED_PATHS: &[&str] = &[
    "query",
    "timestamp",
    "source",
    "source.type",
    "search",
    "search.totalResults",
    "search.processingTime",
    "search.resultIndex",
    "performance.contextCreationUs",
    "performance.searchProcessingTimeMs",
    "user.id",
];

pub fn is_protected(path: &str) -> bool {
    PROTECTED_PATHS.contains(&path)
}

/// Clean one string. Returns `None` when nothing needed removing.
pub fn sanitize_str(input: &str) -> Option<String> {
    if !HTML_TAG.is_match(input) && !SCRIPT_PROTOCOL.is_match(input) {
        return None;
    }
    let without_tags = HTML_TAG.replace_all(input, "");
    let cleaned = SCRIPT_PROTOCOL.replace_all(&without_tags, "");
    Some(cleaned.trim().to_string())
}

/// Clean every string in `value`, recursing into arrays and objects.
/// Returns how many strings changed.
pub fn sanitize_value(value: &mut Value) -> usize {
    match value {
        Value::String(s) => match sanitize_str(s) {
            Some(cleaned) => {
                *s = cleaned;
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(sanitize_value).sum(),
        Value::Object(map) => map.values_mut().map(sanitize_value).sum(),
        _ => 0,
    }
}

/// Remove a dotted path. Returns `true` if something was removed.
pub fn remove_path(value: &mut Value, path: &str) -> bool {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return false;
    };

    let mut current = value;
    for segment in segments {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }

    current
        .as_object_mut()
        .map(|map| map.remove(last).is_some())
        .unwrap_or(false)
}

/// Sanitize a serialized context in place.
pub fn sanitize_context(context: &mut Value, restricted_fields: &[String]) -> SanitizeReport {
    let mut report = SanitizeReport::default();

    if let Some(query) = context.get_mut("query") {
        report.strings_cleaned += sanitize_value(query);
    }
    if let Some(custom) = context.get_mut("custom") {
        report.strings_cleaned += sanitize_value(custom);
    }

    for path in restricted_fields {
        if is_protected(path) {
            report.protected_fields.push(path.clone());
        } else if remove_path(context, path) {
            report.removed_fields.push(path.clone());
        }
    }

    report
}
