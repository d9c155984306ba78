//! In-process provider for tests.

use async_trait::async_trait;
use chrono::Utc;
use cyclone_core::quota::LIMITS_CPU;
use cyclone_core::{
    Error, EventId, Provider, Quantity, Quota, Resource, Result, Worker, WorkerInfo, WorkerInstance,
    WorkerOptions, WorkerRequest, WorkerState,
};
use std::sync::{Arc, Mutex};

pub const KIND_MOCK: &str = "mock";

/// What the next provisioning call does. Provisioning always goes through
/// the trait's admission check.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report the configured resource and build workers.
    Provision,
    /// Report a cloud with no CPU left, so admission fails.
    Busy,
    /// Refuse to build workers with a provisioning error.
    Fail(String),
}

#[derive(Default)]
struct Calls {
    admission_checks: usize,
    requests: Vec<WorkerRequest>,
    terminated: Vec<EventId>,
}

fn saturated() -> Resource {
    let cpu = Quota::new().with(LIMITS_CPU, Quantity::millicores(1000));
    Resource {
        limit: cpu.clone(),
        used: cpu,
    }
}

/// A cloud that records every call and never leaves the process.
pub struct MockCloud {
    name: String,
    behavior: Mutex<Behavior>,
    resource: Mutex<Resource>,
    calls: Arc<Mutex<Calls>>,
}

impl MockCloud {
    pub fn new(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior: Mutex::new(behavior),
            resource: Mutex::new(Resource::new()),
            calls: Arc::new(Mutex::new(Calls::default())),
        }
    }

    pub fn with_resource(self, resource: Resource) -> Self {
        *self.resource.lock().unwrap() = resource;
        self
    }

    pub fn set_resource(&self, resource: Resource) {
        *self.resource.lock().unwrap() = resource;
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Requests that passed admission and reached `new_worker`, in order.
    pub fn requests(&self) -> Vec<WorkerRequest> {
        self.calls.lock().unwrap().requests.clone()
    }

    /// How many times the resource was read.
    pub fn admission_checks(&self) -> usize {
        self.calls.lock().unwrap().admission_checks
    }

    pub fn terminated(&self) -> Vec<EventId> {
        self.calls.lock().unwrap().terminated.clone()
    }
}

#[async_trait]
impl Provider for MockCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND_MOCK
    }

    async fn ping(&self) -> Result<()> {
        match &*self.behavior.lock().unwrap() {
            Behavior::Fail(message) => Err(Error::Provision(message.clone())),
            _ => Ok(()),
        }
    }

    async fn resource(&self) -> Result<Resource> {
        self.calls.lock().unwrap().admission_checks += 1;
        match &*self.behavior.lock().unwrap() {
            Behavior::Busy => Ok(saturated()),
            _ => Ok(self.resource.lock().unwrap().clone()),
        }
    }

    fn new_worker(
        &self,
        request: &WorkerRequest,
        options: &WorkerOptions,
    ) -> Result<Box<dyn Worker>> {
        if let Behavior::Fail(message) = &*self.behavior.lock().unwrap() {
            return Err(Error::Provision(message.clone()));
        }
        self.calls.lock().unwrap().requests.push(request.clone());
        Ok(Box::new(MockWorker {
            info: WorkerInfo::new(request, &self.name, KIND_MOCK),
            state: WorkerState::Created,
            timeout: Some(options.timeout),
            calls: self.calls.clone(),
        }))
    }

    fn load_worker(&self, info: &WorkerInfo) -> Result<Box<dyn Worker>> {
        Ok(Box::new(MockWorker {
            info: info.clone(),
            state: WorkerState::Running,
            timeout: None,
            calls: self.calls.clone(),
        }))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInstance>> {
        let calls = self.calls.lock().unwrap();
        Ok(calls
            .requests
            .iter()
            .filter(|r| !calls.terminated.contains(&r.event_id))
            .map(|r| WorkerInstance {
                name: r.name.clone(),
                status: "Running".to_string(),
                created_at: None,
                event_id: Some(r.event_id.to_string()),
                project: r.project.clone(),
                pipeline: r.pipeline.clone(),
            })
            .collect())
    }
}

struct MockWorker {
    info: WorkerInfo,
    state: WorkerState,
    timeout: Option<std::time::Duration>,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl Worker for MockWorker {
    fn info(&self) -> &WorkerInfo {
        &self.info
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    async fn start(&mut self) -> Result<()> {
        let timeout = self
            .timeout
            .ok_or_else(|| Error::InvalidInput("loaded worker cannot start".to_string()))?;
        self.info.handle = Some(self.info.name.clone());
        self.info.stamp(Utc::now(), timeout);
        self.state = WorkerState::Running;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.info.handle.is_some() {
            self.calls.lock().unwrap().terminated.push(self.info.event_id);
        }
        self.state = WorkerState::Terminated;
        Ok(())
    }
}
