//! Build events and their queue lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::quota::QuotaOverride;
use crate::worker::WorkerInfo;
use crate::{Error, EventId, Result};

/// Kind of work an event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Build a new version of a project; advances the embedded record.
    CreateVersion,
    RunPipeline,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::CreateVersion => "create-version",
            Operation::RunPipeline => "run-pipeline",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create-version" => Ok(Operation::CreateVersion),
            "run-pipeline" => Ok(Operation::RunPipeline),
            other => Err(Error::InvalidInput(format!("unknown operation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Pending,
    Running,
    Success,
    Fail,
    Cancel,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Success | EventStatus::Fail | EventStatus::Cancel
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Success => "success",
            EventStatus::Fail => "fail",
            EventStatus::Cancel => "cancel",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of an event in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be claimed.
    #[default]
    Queued,
    /// Claimed by a manager, not yet handled.
    Dequeued,
    /// Worker provisioned, build in flight.
    Handling,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Dequeued => "dequeued",
            QueueStatus::Handling => "handling",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(QueueStatus::Queued),
            "dequeued" => Ok(QueueStatus::Dequeued),
            "handling" => Ok(QueueStatus::Handling),
            other => Err(Error::InvalidInput(format!("unknown queue status: {other}"))),
        }
    }
}

/// When to send a notification for a finished event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPolicy {
    Always,
    Success,
    Failure,
    #[default]
    Never,
}

impl NotificationPolicy {
    pub fn matches(&self, status: EventStatus) -> bool {
        match self {
            NotificationPolicy::Always => true,
            NotificationPolicy::Success => status == EventStatus::Success,
            NotificationPolicy::Failure => matches!(status, EventStatus::Fail | EventStatus::Cancel),
            NotificationPolicy::Never => false,
        }
    }
}

/// Dependency cache requested by an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    /// `maven`, `npm` or `gradle`.
    pub build_tool: String,
    /// Persistent volume claim holding the cache.
    pub volume: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl From<EventStatus> for RecordStatus {
    fn from(status: EventStatus) -> Self {
        match status {
            EventStatus::Pending => RecordStatus::Pending,
            EventStatus::Running => RecordStatus::Running,
            EventStatus::Success => RecordStatus::Success,
            EventStatus::Fail => RecordStatus::Failed,
            EventStatus::Cancel => RecordStatus::Aborted,
        }
    }
}

/// Build record (a project version or pipeline run) an event reports on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Payload used to submit a new event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub operation: Operation,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub quota: QuotaOverride,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub notification: NotificationPolicy,
    #[serde(default)]
    pub record: Option<BuildRecord>,
}

impl NewEvent {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            project: None,
            pipeline: None,
            namespace: None,
            quota: QuotaOverride::default(),
            cache: None,
            notification: NotificationPolicy::default(),
            record: None,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub operation: Operation,
    pub project: Option<String>,
    pub pipeline: Option<String>,
    pub namespace: Option<String>,
    #[serde(default)]
    pub quota: QuotaOverride,
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub notification: NotificationPolicy,
    pub record: Option<BuildRecord>,
    pub worker: Option<WorkerInfo>,
    pub status: EventStatus,
    pub queue_status: QueueStatus,
    pub retry: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(new: NewEvent) -> Self {
        let now = Utc::now();
        Self {
            id: EventId::new(),
            operation: new.operation,
            project: new.project,
            pipeline: new.pipeline,
            namespace: new.namespace,
            quota: new.quota,
            cache: new.cache,
            notification: new.notification,
            record: new.record,
            worker: None,
            status: EventStatus::Pending,
            queue_status: QueueStatus::Queued,
            retry: 0,
            error_message: None,
            created_at: now,
            in_time: now,
            out_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_handling(&self) -> bool {
        self.queue_status == QueueStatus::Handling
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = EventStatus::Fail;
        self.error_message = Some(message.into());
    }

    /// Copies the event status onto the embedded build record.
    pub fn sync_record(&mut self, now: DateTime<Utc>) {
        let status = self.status;
        let error = self.error_message.clone();
        if let Some(record) = self.record.as_mut() {
            record.status = status.into();
            match status {
                EventStatus::Running => record.start_time = record.start_time.or(Some(now)),
                s if s.is_terminal() => {
                    record.end_time = Some(now);
                    record.error_message = error;
                }
                _ => {}
            }
        }
    }
}
