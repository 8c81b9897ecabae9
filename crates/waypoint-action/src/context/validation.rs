//! Context validation rules.
//!
//! Rules run against the serialized (camelCase JSON) form of a context, so
//! typed and untyped input are checked the same way.

use std::sync::Arc;

use serde_json::Value;

/// Queries longer than this produce a warning, not an error.
pub const MAX_QUERY_CHARS: usize = 1000;

/// Outcome of one validation rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![message.into()],
            warnings: vec![],
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            errors: vec![],
            warnings: vec![message.into()],
        }
    }

    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: ValidationOutcome) {
        self.valid &= other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// A custom validation rule over the serialized context.
pub type ValidationRule = Arc<dyn Fn(&Value) -> ValidationOutcome + Send + Sync>;

/// Expected JSON shape of a required field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    NonEmptyString,
    Number,
}

/// A field every context must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredField {
    pub path: &'static str,
    pub kind: FieldKind,
}

pub const REQUIRED_FIELDS: &[RequiredField] = &[
    RequiredField {
        path: "query",
        kind: FieldKind::NonEmptyString,
    },
    RequiredField {
        path: "timestamp",
        kind: FieldKind::Number,
    },
    RequiredField {
        path: "source.type",
        kind: FieldKind::NonEmptyString,
    },
    RequiredField {
        path: "search.totalResults",
        kind: FieldKind::Number,
    },
];

/// Resolve a dotted path such as `search.totalResults`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Check the built-in required-field rules.
pub fn validate_required(value: &Value) -> ValidationOutcome {
    let mut outcome = ValidationOutcome::ok();

    if !value.is_object() {
        outcome.merge(ValidationOutcome::error("context must be an object"));
        return outcome;
    }

    for field in REQUIRED_FIELDS {
        match (lookup(value, field.path), field.kind) {
            (None, _) | (Some(Value::Null), _) => {
                outcome.merge(ValidationOutcome::error(format!("{} is required", field.path)));
            }
            (Some(Value::String(s)), FieldKind::NonEmptyString) if !s.trim().is_empty() => {}
            (Some(Value::String(_)), FieldKind::NonEmptyString) => {
                outcome.merge(ValidationOutcome::error(format!(
                    "{} must not be empty",
                    field.path
                )));
            }
            (Some(_), FieldKind::NonEmptyString) => {
                outcome.merge(ValidationOutcome::error(format!(
                    "{} must be a string",
                    field.path
                )));
            }
            (Some(Value::Number(_)), FieldKind::Number) => {}
            (Some(_), FieldKind::Number) => {
                outcome.merge(ValidationOutcome::error(format!(
                    "{} must be a number",
                    field.path
                )));
            }
        }
    }

    if let Some(query) = value.get("query").and_then(Value::as_str) {
        if query.chars().count() > MAX_QUERY_CHARS {
            outcome.merge(ValidationOutcome::warning(format!(
                "query exceeds {} characters",
                MAX_QUERY_CHARS
            )));
        }
    }

    outcome
}

/// Run the required-field rules followed by every custom rule.
pub fn validate(value: &Value, rules: &[(String, ValidationRule)]) -> ValidationOutcome {
    let mut outcome = validate_required(value);
    for (name, rule) in rules {
        let mut result = rule(value);
        if !result.valid && result.errors.is_empty() {
            result.errors.push(format!("validation rule '{}' failed", name));
        }
        outcome.merge(result);
    }
    outcome
}
