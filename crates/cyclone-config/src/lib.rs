//! KDL configuration parsing for Cyclone.
//!
//! This crate handles parsing of the system configuration (`cyclone.kdl`):
//! server listen address, worker environment, manager tuning, the initial
//! cloud list and notification endpoint.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ManagerConfig, NotificationConfig, ServerConfig, SystemConfig, load_system_config,
    parse_duration, parse_system_config,
};
