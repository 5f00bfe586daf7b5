//! Configuration system
//!
//! Loads ~/.config/meshbus/bus.yaml with support for:
//! - Relocating the message log, offsets and dead-letter directories
//! - Dual-write into a legacy directory during migrations
//! - Watch, poll and rescan timing
//! - Bounded delivery retry

mod bus_config;
pub mod validation;

pub use bus_config::{BusConfig, DeliveryRetryConfig, StartPosition};
pub use validation::{validate_config, validate_config_result, ValidationError};
