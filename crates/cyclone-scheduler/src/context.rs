//! Shared state handed to the event manager and the HTTP layer.

use cyclone_cloud::CloudController;
use cyclone_core::WorkerOptions;
use std::sync::Arc;
use std::time::Duration;

/// Ceiling on the backoff multiplier applied to busy retries.
const MAX_BACKOFF_STEPS: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    /// Sleep between polls that found nothing to do.
    pub poll_interval: Duration,
    /// Busy retries allowed before an event fails.
    pub max_retry: u32,
    /// Unit of the busy backoff.
    pub retry_interval: Duration,
    /// Endpoint receiving finished-event notifications.
    pub notification_url: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_retry: 60,
            retry_interval: Duration::from_secs(60),
            notification_url: None,
        }
    }
}

impl ManagerSettings {
    /// Delay before the `retry`-th busy retry: `min(retry, 10) × retry_interval`,
    /// saturating at [`Duration::MAX`].
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry_interval
            .checked_mul(retry.min(MAX_BACKOFF_STEPS))
            .unwrap_or(Duration::MAX)
    }
}

pub struct SchedulerContext {
    pub controller: Arc<CloudController>,
    pub settings: ManagerSettings,
}

impl SchedulerContext {
    pub fn new(controller: Arc<CloudController>, settings: ManagerSettings) -> Self {
        Self {
            controller,
            settings,
        }
    }

    pub fn worker_options(&self) -> &WorkerOptions {
        self.controller.options()
    }
}
