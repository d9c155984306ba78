//! Repository traits and implementations.

pub mod cloud;
pub mod event;

pub use cloud::{CloudRepo, MemoryCloudRepo, PgCloudRepo};
pub use event::{CLAIM_TIMEOUT, EventRepo, MemoryEventRepo, PgEventRepo};
