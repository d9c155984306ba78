//! Event manager: queue consumer, retry policy and timeout watchdog.

use chrono::{DateTime, Utc};
use cyclone_core::{Error, Event, EventId, EventStatus, NewEvent, QueueStatus, Result};
use cyclone_db::{DbError, EventRepo};
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{HandlerRegistry, PostHook, SchedulerContext};

/// Consumes the event queue.
///
/// Events are dispatched one at a time from the poll loop; each provisioned
/// event gets its own watchdog task so that a long build never blocks the
/// queue. The store is the single source of truth, nothing is cached across
/// polls.
pub struct EventManager {
    ctx: Arc<SchedulerContext>,
    events: Arc<dyn EventRepo>,
    handlers: HandlerRegistry,
    hook: Arc<dyn PostHook>,
}

impl EventManager {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        events: Arc<dyn EventRepo>,
        handlers: HandlerRegistry,
        hook: Arc<dyn PostHook>,
    ) -> Self {
        Self {
            ctx,
            events,
            handlers,
            hook,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Run the poll loop forever.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval = ?self.ctx.settings.poll_interval,
            max_retry = self.ctx.settings.max_retry,
            "Starting event manager"
        );

        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => sleep(self.ctx.settings.poll_interval).await,
                Err(e) => {
                    warn!(error = %e, "Failed to process event");
                    sleep(self.ctx.settings.poll_interval).await;
                }
            }
        }
    }

    /// Claim and handle at most one event. Returns whether one was claimed.
    pub async fn poll_once(self: &Arc<Self>) -> Result<bool> {
        match self.events.next().await? {
            Some(event) => {
                self.handle_event(event).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle_event(self: &Arc<Self>, mut event: Event) -> Result<()> {
        info!(event_id = %event.id, operation = %event.operation, retry = event.retry, "Handling event");

        let outcome = match self.handlers.get(event.operation) {
            Some(handler) => handler.handle(&self.ctx, &mut event).await,
            None => Err(Error::InvalidInput(format!(
                "no handler registered for operation {}",
                event.operation
            ))),
        };

        match outcome {
            Ok(()) => {
                event.status = EventStatus::Running;
                event.queue_status = QueueStatus::Handling;
                if let Err(e) = self.events.update(&event).await {
                    error!(event_id = %event.id, error = %e, "Failed to persist running event");
                    if let Some(worker) = &event.worker {
                        if let Err(e) = self.ctx.controller.terminate_worker(worker).await {
                            warn!(event_id = %event.id, error = %e, "Failed to terminate orphaned worker");
                        }
                    }
                    return Err(e.into());
                }
                self.spawn_watchdog(event.id);
                Ok(())
            }
            Err(e) if e.is_all_clouds_busy() && event.retry < self.ctx.settings.max_retry => {
                event.retry += 1;
                let delay = self.ctx.settings.backoff(event.retry);
                let not_before = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                info!(
                    event_id = %event.id,
                    retry = event.retry,
                    delay = ?delay,
                    "All clouds busy, requeueing event"
                );
                self.events.requeue(&event, not_before).await?;
                Ok(())
            }
            Err(e) => {
                warn!(event_id = %event.id, retry = event.retry, error = %e, "Event failed");
                event.fail(e.to_string());
                self.finish(event).await
            }
        }
    }

    /// Single mutation entry point for in-flight events.
    ///
    /// A terminal event runs its post-hook and leaves the active queue; any
    /// other event is persisted as is.
    pub async fn update_event(&self, event: Event) -> Result<()> {
        if event.is_terminal() {
            self.finish(event).await
        } else {
            Ok(self.events.update(&event).await?)
        }
    }

    /// Only the caller that moves the event to its terminal status runs the
    /// post-hook; later callers get [`Error::Conflict`].
    async fn finish(&self, mut event: Event) -> Result<()> {
        event.sync_record(Utc::now());
        if !self.events.close(&event).await? {
            return Err(Error::Conflict(format!("event {} already finished", event.id)));
        }
        self.hook.run(&event).await;
        self.events.archive(&event).await?;
        info!(event_id = %event.id, status = %event.status, "Event finished");
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>, id: EventId) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.watch_timeout(id).await {
                warn!(event_id = %id, error = %e, "Timeout watchdog failed");
            }
        });
    }

    /// Wait for the event's worker deadline; cancel the event if it is still
    /// running by then, fail it if the deadline had already passed.
    pub async fn watch_timeout(&self, id: EventId) -> Result<()> {
        let mut event = self.events.get(id).await?;
        if event.is_terminal() {
            return Ok(());
        }
        let Some(worker) = event.worker.as_ref() else {
            warn!(event_id = %id, "Event has no worker to watch");
            return Ok(());
        };

        let (overdue, remaining) = worker.is_timeout(Utc::now());
        if overdue {
            warn!(event_id = %id, worker = %worker.name, "Worker already past its deadline");
            event.fail("worker exceeded its deadline");
            return self.update_event(event).await;
        }

        sleep(remaining).await;

        let mut event = match self.events.get(id).await {
            Ok(event) => event,
            Err(DbError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if event.is_terminal() {
            return Ok(());
        }
        warn!(event_id = %id, "Worker timed out, cancelling event");
        event.status = EventStatus::Cancel;
        event.error_message = Some(format!(
            "worker timed out after {:?}",
            self.ctx.worker_options().timeout
        ));
        match self.update_event(event).await {
            Err(Error::Conflict(_)) => {
                debug!(event_id = %id, "Event finished before the watchdog fired");
                Ok(())
            }
            other => other,
        }
    }

    /// Restart watchdogs for events that were in flight when the process stopped.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let handling: Vec<Event> = self
            .events
            .list_active()
            .await?
            .into_iter()
            .filter(|e| e.is_handling() && !e.is_terminal())
            .collect();

        for event in &handling {
            self.spawn_watchdog(event.id);
        }
        info!(count = handling.len(), "Recovered in-flight events");
        Ok(handling.len())
    }

    /// Validate and enqueue a new event.
    pub async fn submit_event(&self, new: NewEvent) -> Result<Event> {
        self.ctx.worker_options().default_quota.overridden(&new.quota)?;
        let event = self.events.create(Event::new(new)).await?;
        info!(event_id = %event.id, operation = %event.operation, "Event submitted");
        Ok(event)
    }

    pub async fn get_event(&self, id: EventId) -> Result<Event> {
        Ok(self.events.get(id).await?)
    }

    pub async fn list_events(&self) -> Result<Vec<Event>> {
        Ok(self.events.list_active().await?)
    }

    /// Remove an event; a handling event also loses its worker.
    pub async fn delete_event(&self, id: EventId) -> Result<()> {
        let event = self.events.get(id).await?;
        if event.is_handling() && !event.is_terminal() {
            if let Some(worker) = &event.worker {
                self.ctx.controller.terminate_worker(worker).await?;
            }
        }
        self.events.delete(id).await?;
        info!(event_id = %id, "Event deleted");
        Ok(())
    }

    /// Status reported by the worker itself.
    pub async fn complete_event(
        &self,
        id: EventId,
        status: EventStatus,
        error_message: Option<String>,
    ) -> Result<Event> {
        let mut event = self.events.get(id).await?;
        if event.is_terminal() {
            return Err(Error::Conflict(format!(
                "event {} already finished with status {}",
                id, event.status
            )));
        }
        event.status = status;
        if error_message.is_some() {
            event.error_message = error_message;
        }
        self.update_event(event.clone()).await?;
        Ok(event)
    }
}
