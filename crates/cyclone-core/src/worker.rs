//! Worker trait and descriptor types.
//!
//! A worker is the ephemeral container or pod that runs one event's build.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::quota::{Quota, default_quota};
use crate::{EventId, Result};

/// Label put on every provisioned compute unit.
pub const WORKER_LABEL_KEY: &str = "cyclone";
pub const WORKER_LABEL_VALUE: &str = "worker";
/// Label carrying the owning event id.
pub const EVENT_ID_LABEL: &str = "cyclone/id";

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Created,
    Starting,
    Running,
    Timeout,
    Terminated,
}

/// Everything needed to find a worker again after the provisioning call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub event_id: EventId,
    pub name: String,
    pub cloud_name: String,
    pub cloud_kind: String,
    /// Backend handle: container id for Docker, pod name for Kubernetes.
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub quota: Quota,
    #[serde(default)]
    pub cache_volume: Option<String>,
    #[serde(default)]
    pub mount_path: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_time: Option<DateTime<Utc>>,
}

impl WorkerInfo {
    pub fn new(request: &WorkerRequest, cloud_name: &str, cloud_kind: &str) -> Self {
        Self {
            event_id: request.event_id,
            name: request.name.clone(),
            cloud_name: cloud_name.to_string(),
            cloud_kind: cloud_kind.to_string(),
            handle: None,
            namespace: request.namespace.clone(),
            quota: request.quota.clone(),
            cache_volume: request.cache_volume.clone(),
            mount_path: request.mount_path.clone(),
            start_time: None,
            due_time: None,
        }
    }

    /// Records a successful start and the deadline derived from `timeout`.
    pub fn stamp(&mut self, now: DateTime<Utc>, timeout: Duration) {
        let window = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.start_time = Some(now);
        self.due_time = Some(now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    /// `(true, 0)` once `now` has reached the due time, else `(false, remaining)`.
    ///
    /// A worker that was never stamped has no deadline left.
    pub fn is_timeout(&self, now: DateTime<Utc>) -> (bool, Duration) {
        let Some(due) = self.due_time else {
            return (true, Duration::ZERO);
        };
        match (due - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => (false, remaining),
            _ => (true, Duration::ZERO),
        }
    }
}

/// Request to provision a worker for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub event_id: EventId,
    pub name: String,
    pub quota: Quota,
    pub namespace: Option<String>,
    pub cache_volume: Option<String>,
    pub mount_path: Option<String>,
    pub project: Option<String>,
    pub pipeline: Option<String>,
    pub record_id: Option<String>,
}

impl WorkerRequest {
    pub fn new(event_id: EventId) -> Self {
        Self {
            event_id,
            name: event_id.worker_name(),
            quota: Quota::new(),
            namespace: None,
            cache_volume: None,
            mount_path: None,
            project: None,
            pipeline: None,
            record_id: None,
        }
    }

    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = quota;
        self
    }
}

/// Endpoints and credentials handed to every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEnv {
    pub server: String,
    pub console_web: String,
    /// Completion callback. Empty means derived from `server`.
    pub callback_url: String,
    pub registry_location: String,
    pub registry_username: String,
    pub registry_password: String,
    pub gitlab_url: String,
    pub log_server: String,
    pub worker_image: String,
}

impl Default for WorkerEnv {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:7099".to_string(),
            console_web: "http://127.0.0.1:3000".to_string(),
            callback_url: String::new(),
            registry_location: "cargo.caicloud.io".to_string(),
            registry_username: String::new(),
            registry_password: String::new(),
            gitlab_url: "https://gitlab.com".to_string(),
            log_server: "ws://127.0.0.1:8000/ws".to_string(),
            worker_image: "cargo.caicloud.io/caicloud/cyclone-worker".to_string(),
        }
    }
}

/// Process-wide provisioning options.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub env: WorkerEnv,
    pub default_quota: Quota,
    /// How long a worker may run before the watchdog gives up on it.
    pub timeout: Duration,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// Log the worker's output before tearing it down.
    pub debug: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            env: WorkerEnv::default(),
            default_quota: default_quota(),
            timeout: Duration::from_secs(2 * 60 * 60),
            ready_poll_interval: Duration::from_secs(7),
            ready_timeout: Duration::from_secs(2 * 60),
            debug: false,
        }
    }
}

/// A labelled compute unit found on a cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub name: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

/// A live handle to a worker on some backend.
#[async_trait]
pub trait Worker: Send + Sync {
    fn info(&self) -> &WorkerInfo;

    fn state(&self) -> WorkerState;

    /// Create the compute unit and bring it up. Blocks until it runs.
    async fn start(&mut self) -> Result<()>;

    fn is_timeout(&self) -> (bool, Duration) {
        self.info().is_timeout(Utc::now())
    }

    /// Force-remove the compute unit. Already gone is not an error.
    async fn terminate(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> WorkerInfo {
        WorkerInfo::new(&WorkerRequest::new(EventId::new()), "local", "docker")
    }

    #[test]
    fn test_is_timeout_overdue() {
        let mut info = info();
        let now = Utc::now();
        info.due_time = Some(now - chrono::Duration::seconds(1));
        assert_eq!(info.is_timeout(now), (true, Duration::ZERO));
    }

    #[test]
    fn test_is_timeout_remaining() {
        let mut info = info();
        let now = Utc::now();
        info.due_time = Some(now + chrono::Duration::seconds(10));
        assert_eq!(info.is_timeout(now), (false, Duration::from_secs(10)));
    }

    #[test]
    fn test_unstamped_worker_is_overdue() {
        assert_eq!(info().is_timeout(Utc::now()), (true, Duration::ZERO));
    }

    #[test]
    fn test_stamp_sets_due_time() {
        let mut info = info();
        let now = Utc::now();
        info.stamp(now, Duration::from_secs(7200));
        assert_eq!(info.start_time, Some(now));
        assert_eq!(info.due_time, Some(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_request_names_worker_after_event() {
        let id = EventId::new();
        let request = WorkerRequest::new(id);
        assert_eq!(request.name, format!("cyclone-worker-{id}"));
        assert!(request.quota.is_zero());
    }

    #[test]
    fn test_default_options() {
        let options = WorkerOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(7200));
        assert_eq!(options.ready_poll_interval, Duration::from_secs(7));
        assert_eq!(options.default_quota, default_quota());
    }
}
