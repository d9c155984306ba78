//! Core domain types and traits for Cyclone.
//!
//! This crate defines the resource model, the capability contracts every
//! cloud backend implements, and the event types the scheduler consumes.

pub mod error;
pub mod event;
pub mod id;
pub mod provider;
pub mod quota;
pub mod worker;

pub use error::{CloudProvisionError, Error, Result};
pub use event::{
    BuildRecord, CacheSpec, Event, EventStatus, NewEvent, NotificationPolicy, Operation,
    QueueStatus, RecordStatus,
};
pub use id::EventId;
pub use provider::{CloudConfig, DockerSettings, KubernetesSettings, Provider};
pub use quota::{Quantity, Quota, QuotaOverride, Resource};
pub use worker::{
    Worker, WorkerEnv, WorkerInfo, WorkerInstance, WorkerOptions, WorkerRequest, WorkerState,
};
