use thiserror::Error;

/// Top-level error type for Waypoint.
///
/// Subsystem crates define their own error types and wrap this one with
/// `#[from]` so the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaypointError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for WaypointError {
    fn from(err: toml::de::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for WaypointError {
    fn from(err: toml::ser::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WaypointError {
    fn from(err: serde_json::Error) -> Self {
        WaypointError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Waypoint operations.
pub type Result<T> = std::result::Result<T, WaypointError>;
