//! Tracing subscriber setup for embedding applications.

use tracing_subscriber::EnvFilter;

use crate::config::GeneralConfig;

/// Install a global fmt subscriber filtered at `level`.
///
/// `RUST_LOG` takes precedence when set. Returns `false` if a global
/// subscriber was already installed, which makes repeated calls harmless.
pub fn init(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

/// Install the subscriber using the `[general]` config section.
pub fn init_from_config(config: &GeneralConfig) -> bool {
    init(&config.log_level)
}
