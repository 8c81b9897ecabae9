//! Shared vocabulary for the Waypoint action pipeline: configuration,
//! lifecycle events, errors and the search result value type.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod types;

pub use config::WaypointConfig;
pub use error::{Result, WaypointError};
pub use events::{ActionEvent, EventBus, InMemoryEventBus, SubscribeOptions, SubscriptionId};
pub use types::*;
