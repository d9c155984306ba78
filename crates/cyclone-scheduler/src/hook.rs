//! Actions run once an event reaches a terminal status.

use async_trait::async_trait;
use cyclone_cloud::CloudController;
use cyclone_core::{BuildRecord, Event, EventId, EventStatus, Operation};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs after an event finishes, before it leaves the active queue.
///
/// Failures are logged by the hook itself; they never change the event.
#[async_trait]
pub trait PostHook: Send + Sync {
    async fn run(&self, event: &Event);
}

/// Body POSTed to the notification endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub event_id: EventId,
    pub operation: Operation,
    pub status: EventStatus,
    pub project: Option<&'a str>,
    pub pipeline: Option<&'a str>,
    pub error_message: Option<&'a str>,
    pub record: Option<&'a BuildRecord>,
}

impl<'a> From<&'a Event> for Notification<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_id: event.id,
            operation: event.operation,
            status: event.status,
            project: event.project.as_deref(),
            pipeline: event.pipeline.as_deref(),
            error_message: event.error_message.as_deref(),
            record: event.record.as_ref(),
        }
    }
}

/// Tears down the event's worker, then notifies when the event's policy asks for it.
pub struct DefaultPostHook {
    controller: Arc<CloudController>,
    client: reqwest::Client,
    notification_url: Option<String>,
}

impl DefaultPostHook {
    pub fn new(controller: Arc<CloudController>, notification_url: Option<String>) -> Self {
        Self {
            controller,
            client: reqwest::Client::new(),
            notification_url,
        }
    }

    async fn notify(&self, url: &str, event: &Event) -> reqwest::Result<()> {
        self.client
            .post(url)
            .timeout(NOTIFY_TIMEOUT)
            .json(&Notification::from(event))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl PostHook for DefaultPostHook {
    async fn run(&self, event: &Event) {
        if let Some(worker) = &event.worker {
            match self.controller.terminate_worker(worker).await {
                Ok(()) => info!(event_id = %event.id, worker = %worker.name, "Worker terminated"),
                Err(e) => {
                    warn!(event_id = %event.id, worker = %worker.name, error = %e, "Failed to terminate worker")
                }
            }
        }

        let Some(url) = self.notification_url.as_deref() else {
            return;
        };
        if !event.notification.matches(event.status) {
            debug!(event_id = %event.id, status = %event.status, "Notification not requested");
            return;
        }
        match self.notify(url, event).await {
            Ok(()) => info!(event_id = %event.id, status = %event.status, "Notification sent"),
            Err(e) => warn!(event_id = %event.id, error = %e, "Failed to send notification"),
        }
    }
}
