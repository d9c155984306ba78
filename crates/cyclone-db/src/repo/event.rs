//! Durable event queue.
//!
//! Events move `queued → dequeued → handling` while active. `next` claims
//! atomically; a claim older than [`CLAIM_TIMEOUT`] is considered abandoned
//! by a crashed manager and can be claimed again. Archived events leave the
//! queue but stay readable by id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyclone_core::{Event, EventId, QueueStatus};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::{DbError, DbResult};

/// How long a dequeued event may stay unhandled before it is claimable again.
pub const CLAIM_TIMEOUT: Duration = Duration::from_secs(3 * 60);

#[async_trait]
pub trait EventRepo: Send + Sync {
    /// Enqueue `event` with `in_time = now`.
    async fn create(&self, event: Event) -> DbResult<Event>;
    /// Active or archived event.
    async fn get(&self, id: EventId) -> DbResult<Event>;
    /// Claim the oldest claimable event, if any.
    async fn next(&self) -> DbResult<Option<Event>>;
    async fn update(&self, event: &Event) -> DbResult<()>;
    /// Put `event` back in the queue, claimable from `not_before`.
    async fn requeue(&self, event: &Event, not_before: DateTime<Utc>) -> DbResult<()>;
    /// Persist a terminal `event` unless the stored copy is already terminal.
    /// Returns whether this call made the transition.
    async fn close(&self, event: &Event) -> DbResult<bool>;
    async fn archive(&self, event: &Event) -> DbResult<()>;
    async fn delete(&self, id: EventId) -> DbResult<()>;
    async fn list_active(&self) -> DbResult<Vec<Event>>;
}

fn claim_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now - chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::zero())
}

#[derive(sqlx::FromRow)]
struct EventRow {
    payload: serde_json::Value,
    queue_status: String,
    retry: i32,
    in_time: DateTime<Utc>,
    out_time: Option<DateTime<Utc>>,
}

impl EventRow {
    fn into_event(self) -> DbResult<Event> {
        let mut event: Event = serde_json::from_value(self.payload)?;
        event.queue_status = self
            .queue_status
            .parse()
            .map_err(|e: cyclone_core::Error| DbError::Corrupt(e.to_string()))?;
        event.retry = u32::try_from(self.retry)
            .map_err(|_| DbError::Corrupt(format!("negative retry for event {}", event.id)))?;
        event.in_time = self.in_time;
        event.out_time = self.out_time;
        Ok(event)
    }
}

/// PostgreSQL implementation of EventRepo.
pub struct PgEventRepo {
    pool: PgPool,
    claim_timeout: Duration,
}

impl PgEventRepo {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_timeout: CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    async fn write(&self, event: &Event) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $2, queue_status = $3, retry = $4, payload = $5, in_time = $6, out_time = $7
            WHERE id = $1 AND NOT archived
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.status.as_str())
        .bind(event.queue_status.as_str())
        .bind(event.retry as i32)
        .bind(serde_json::to_value(event)?)
        .bind(event.in_time)
        .bind(event.out_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("event {}", event.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EventRepo for PgEventRepo {
    async fn create(&self, mut event: Event) -> DbResult<Event> {
        event.queue_status = QueueStatus::Queued;
        event.in_time = Utc::now();
        event.out_time = None;

        sqlx::query(
            r#"
            INSERT INTO events (id, operation, status, queue_status, retry, payload, created_at, in_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.operation.as_str())
        .bind(event.status.as_str())
        .bind(event.queue_status.as_str())
        .bind(event.retry as i32)
        .bind(serde_json::to_value(&event)?)
        .bind(event.created_at)
        .bind(event.in_time)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("event {}", event.id))
            }
            other => DbError::Database(other),
        })?;
        Ok(event)
    }

    async fn get(&self, id: EventId) -> DbResult<Event> {
        sqlx::query_as::<_, EventRow>(
            "SELECT payload, queue_status, retry, in_time, out_time FROM events WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("event {}", id)))?
        .into_event()
    }

    async fn next(&self) -> DbResult<Option<Event>> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            UPDATE events
            SET queue_status = 'dequeued', out_time = $1
            WHERE id = (
                SELECT id FROM events
                WHERE NOT archived
                  AND ((queue_status = 'queued' AND in_time <= $1)
                    OR (queue_status = 'dequeued' AND out_time < $2))
                ORDER BY in_time ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload, queue_status, retry, in_time, out_time
            "#,
        )
        .bind(now)
        .bind(claim_cutoff(now, self.claim_timeout))
        .fetch_optional(&self.pool)
        .await?;

        let event = row.map(EventRow::into_event).transpose()?;
        if let Some(event) = &event {
            debug!(event_id = %event.id, retry = event.retry, "Claimed event");
        }
        Ok(event)
    }

    async fn update(&self, event: &Event) -> DbResult<()> {
        self.write(event).await
    }

    async fn requeue(&self, event: &Event, not_before: DateTime<Utc>) -> DbResult<()> {
        let mut event = event.clone();
        event.queue_status = QueueStatus::Queued;
        event.in_time = not_before;
        event.out_time = None;
        self.write(&event).await
    }

    async fn close(&self, event: &Event) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = $2, queue_status = $3, retry = $4, payload = $5
            WHERE id = $1 AND NOT archived AND status NOT IN ('success', 'fail', 'cancel')
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.status.as_str())
        .bind(event.queue_status.as_str())
        .bind(event.retry as i32)
        .bind(serde_json::to_value(event)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE id = $1)")
            .bind(event.id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(false)
        } else {
            Err(DbError::NotFound(format!("event {}", event.id)))
        }
    }

    async fn archive(&self, event: &Event) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE events SET archived = TRUE, status = $2, payload = $3 WHERE id = $1",
        )
        .bind(event.id.as_uuid())
        .bind(event.status.as_str())
        .bind(serde_json::to_value(event)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("event {}", event.id)));
        }
        Ok(())
    }

    async fn delete(&self, id: EventId) -> DbResult<()> {
        sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active(&self) -> DbResult<Vec<Event>> {
        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT payload, queue_status, retry, in_time, out_time
            FROM events
            WHERE NOT archived
            ORDER BY in_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(EventRow::into_event)
        .collect()
    }
}

struct Stored {
    event: Event,
    archived: bool,
}

/// In-process implementation of EventRepo.
pub struct MemoryEventRepo {
    events: Mutex<HashMap<EventId, Stored>>,
    claim_timeout: Duration,
}

impl MemoryEventRepo {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
            claim_timeout: CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    fn lock(&self) -> DbResult<std::sync::MutexGuard<'_, HashMap<EventId, Stored>>> {
        self.events
            .lock()
            .map_err(|_| DbError::Corrupt("event store lock poisoned".to_string()))
    }

    fn write(&self, event: Event) -> DbResult<()> {
        let mut events = self.lock()?;
        match events.get_mut(&event.id) {
            Some(stored) if !stored.archived => {
                stored.event = event;
                Ok(())
            }
            _ => Err(DbError::NotFound(format!("event {}", event.id))),
        }
    }
}

impl Default for MemoryEventRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRepo for MemoryEventRepo {
    async fn create(&self, mut event: Event) -> DbResult<Event> {
        event.queue_status = QueueStatus::Queued;
        event.in_time = Utc::now();
        event.out_time = None;

        let mut events = self.lock()?;
        if events.contains_key(&event.id) {
            return Err(DbError::Duplicate(format!("event {}", event.id)));
        }
        events.insert(
            event.id,
            Stored {
                event: event.clone(),
                archived: false,
            },
        );
        Ok(event)
    }

    async fn get(&self, id: EventId) -> DbResult<Event> {
        self.lock()?
            .get(&id)
            .map(|stored| stored.event.clone())
            .ok_or_else(|| DbError::NotFound(format!("event {}", id)))
    }

    async fn next(&self) -> DbResult<Option<Event>> {
        let now = Utc::now();
        let cutoff = claim_cutoff(now, self.claim_timeout);
        let mut events = self.lock()?;

        let claimable = events
            .values_mut()
            .filter(|stored| !stored.archived)
            .filter(|stored| match stored.event.queue_status {
                QueueStatus::Queued => stored.event.in_time <= now,
                QueueStatus::Dequeued => stored.event.out_time.is_none_or(|out| out < cutoff),
                QueueStatus::Handling => false,
            })
            .min_by_key(|stored| (stored.event.in_time, stored.event.id));

        Ok(claimable.map(|stored| {
            stored.event.queue_status = QueueStatus::Dequeued;
            stored.event.out_time = Some(now);
            stored.event.clone()
        }))
    }

    async fn update(&self, event: &Event) -> DbResult<()> {
        self.write(event.clone())
    }

    async fn requeue(&self, event: &Event, not_before: DateTime<Utc>) -> DbResult<()> {
        let mut event = event.clone();
        event.queue_status = QueueStatus::Queued;
        event.in_time = not_before;
        event.out_time = None;
        self.write(event)
    }

    async fn close(&self, event: &Event) -> DbResult<bool> {
        let mut events = self.lock()?;
        let stored = events
            .get_mut(&event.id)
            .ok_or_else(|| DbError::NotFound(format!("event {}", event.id)))?;
        if stored.archived || stored.event.is_terminal() {
            return Ok(false);
        }
        stored.event = event.clone();
        Ok(true)
    }

    async fn archive(&self, event: &Event) -> DbResult<()> {
        let mut events = self.lock()?;
        let stored = events
            .get_mut(&event.id)
            .ok_or_else(|| DbError::NotFound(format!("event {}", event.id)))?;
        stored.event = event.clone();
        stored.archived = true;
        Ok(())
    }

    async fn delete(&self, id: EventId) -> DbResult<()> {
        self.lock()?.remove(&id);
        Ok(())
    }

    async fn list_active(&self) -> DbResult<Vec<Event>> {
        let mut active: Vec<Event> = self
            .lock()?
            .values()
            .filter(|stored| !stored.archived)
            .map(|stored| stored.event.clone())
            .collect();
        active.sort_by_key(|event| (event.in_time, event.id));
        Ok(active)
    }
}
