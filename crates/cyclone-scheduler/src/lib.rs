//! Event processing for Cyclone.
//!
//! The [`EventManager`] consumes the durable event queue, provisions a worker
//! for each event through the cloud controller, retries while every cloud is
//! busy and watches in-flight workers for their deadline.

pub mod context;
pub mod handler;
pub mod hook;
pub mod manager;

pub use context::{ManagerSettings, SchedulerContext};
pub use handler::{EventHandler, HandlerRegistry, ProvisionHandler};
pub use hook::{DefaultPostHook, Notification, PostHook};
pub use manager::EventManager;
