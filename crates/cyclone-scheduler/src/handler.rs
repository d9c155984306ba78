//! Operation handlers.

use async_trait::async_trait;
use chrono::Utc;
use cyclone_core::{Error, Event, Operation, RecordStatus, Result, WorkerOptions, WorkerRequest};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::SchedulerContext;

/// Handles one kind of event.
///
/// On success the handler has attached a provisioned worker to the event; the
/// manager persists the event as running.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &SchedulerContext, event: &mut Event) -> Result<()>;
}

/// Handlers keyed by operation.
pub struct HandlerRegistry {
    handlers: HashMap<Operation, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// `create-version` and `run-pipeline`.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(
            Operation::CreateVersion,
            Arc::new(ProvisionHandler::advancing_record()),
        );
        registry.register(Operation::RunPipeline, Arc::new(ProvisionHandler::new()));
        registry
    }

    pub fn register(&mut self, operation: Operation, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(operation, handler);
    }

    pub fn get(&self, operation: Operation) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&operation).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Provisions a worker for the event through the cloud controller.
pub struct ProvisionHandler {
    advance_record: bool,
}

impl ProvisionHandler {
    pub fn new() -> Self {
        Self {
            advance_record: false,
        }
    }

    /// Also moves the event's build record to running once the worker is up.
    pub fn advancing_record() -> Self {
        Self {
            advance_record: true,
        }
    }
}

impl Default for ProvisionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for ProvisionHandler {
    async fn handle(&self, ctx: &SchedulerContext, event: &mut Event) -> Result<()> {
        let request = worker_request(event, ctx.worker_options())?;
        let worker = ctx.controller.provision(&request).await?;
        info!(
            event_id = %event.id,
            cloud = %worker.cloud_name,
            worker = %worker.name,
            "Worker provisioned"
        );
        event.worker = Some(worker);

        if self.advance_record {
            if let Some(record) = event.record.as_mut() {
                record.status = RecordStatus::Running;
                record.start_time.get_or_insert_with(Utc::now);
            }
        }
        Ok(())
    }
}

/// Worker request for `event`: default quota with the event's override applied,
/// plus the dependency cache binding if one was requested.
pub fn worker_request(event: &Event, options: &WorkerOptions) -> Result<WorkerRequest> {
    let quota = options.default_quota.overridden(&event.quota)?;
    let mut request = WorkerRequest::new(event.id).with_quota(quota);
    request.namespace = event.namespace.clone();
    request.project = event.project.clone();
    request.pipeline = event.pipeline.clone();
    request.record_id = event.record.as_ref().map(|r| r.id.clone());

    if let Some(cache) = &event.cache {
        request.mount_path = Some(cache_mount_path(&cache.build_tool)?.to_string());
        request.cache_volume = Some(cache.volume.clone());
    }
    Ok(request)
}

/// Where a build tool keeps its dependency cache inside the worker.
pub fn cache_mount_path(build_tool: &str) -> Result<&'static str> {
    match build_tool {
        "maven" => Ok("/root/.m2"),
        "npm" => Ok("/root/.npm"),
        "gradle" => Ok("/root/.gradle"),
        other => Err(Error::InvalidInput(format!(
            "unsupported build tool for dependency cache: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclone_core::quota::{LIMITS_CPU, LIMITS_MEMORY};
    use cyclone_core::{CacheSpec, NewEvent, Quantity};

    #[test]
    fn test_worker_request_applies_override() {
        let mut new = NewEvent::new(Operation::RunPipeline);
        new.project = Some("web".to_string());
        new.pipeline = Some("ci".to_string());
        new.quota.limits_cpu = Some("2".to_string());
        let event = Event::new(new);

        let request = worker_request(&event, &WorkerOptions::default()).unwrap();
        assert_eq!(request.name, event.id.worker_name());
        assert_eq!(request.quota.get(LIMITS_CPU), Some(&Quantity::cores(2.0)));
        assert_eq!(
            request.quota.get(LIMITS_MEMORY),
            Some(&"500Mi".parse::<Quantity>().unwrap())
        );
        assert_eq!(request.project.as_deref(), Some("web"));
        assert!(request.cache_volume.is_none());
    }

    #[test]
    fn test_worker_request_rejects_bad_override() {
        let mut new = NewEvent::new(Operation::RunPipeline);
        new.quota.limits_memory = Some("a lot".to_string());
        let event = Event::new(new);
        assert!(matches!(
            worker_request(&event, &WorkerOptions::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cache_binding() {
        let mut new = NewEvent::new(Operation::RunPipeline);
        new.cache = Some(CacheSpec {
            build_tool: "gradle".to_string(),
            volume: "web-cache".to_string(),
        });
        let request = worker_request(&Event::new(new), &WorkerOptions::default()).unwrap();
        assert_eq!(request.mount_path.as_deref(), Some("/root/.gradle"));
        assert_eq!(request.cache_volume.as_deref(), Some("web-cache"));
    }

    #[test]
    fn test_cache_mount_paths() {
        assert_eq!(cache_mount_path("maven").unwrap(), "/root/.m2");
        assert_eq!(cache_mount_path("npm").unwrap(), "/root/.npm");
        assert!(cache_mount_path("cargo").is_err());
    }

    #[test]
    fn test_default_registry() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(Operation::CreateVersion).is_some());
        assert!(registry.get(Operation::RunPipeline).is_some());
        assert!(HandlerRegistry::empty().get(Operation::RunPipeline).is_none());
    }
}
