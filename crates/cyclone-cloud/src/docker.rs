//! Docker cloud implementation.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Utc};
use cyclone_core::provider::KIND_DOCKER;
use cyclone_core::quota::{Format, LIMITS_CPU, LIMITS_MEMORY};
use cyclone_core::worker::{EVENT_ID_LABEL, WORKER_LABEL_KEY, WORKER_LABEL_VALUE};
use cyclone_core::{
    CloudConfig, Error, Provider, Quantity, Quota, Resource, Result, Worker, WorkerInfo,
    WorkerInstance, WorkerOptions, WorkerRequest, WorkerState,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::env::{CLONE_DIR, image_reference, worker_env};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// A Docker daemon used as a cloud.
pub struct DockerCloud {
    name: String,
    docker: Docker,
    debug: bool,
}

impl DockerCloud {
    /// Connect to the daemon described by `config`.
    ///
    /// `unix://` hosts use the socket, `tcp://` hosts use HTTP, or TLS when a
    /// certificate directory is configured.
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let settings = config.docker_settings()?;
        let host = settings.host.as_str();
        let connect_err =
            |e: DockerError| Error::Config(format!("cannot connect to docker at {host}: {e}"));

        let docker = if let Some(socket) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                .map_err(connect_err)?
        } else if let Some(certs) = settings.cert_path.as_deref().filter(|p| !p.is_empty()) {
            let certs = Path::new(certs);
            Docker::connect_with_ssl(
                host,
                &certs.join("key.pem"),
                &certs.join("cert.pem"),
                &certs.join("ca.pem"),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )
            .map_err(connect_err)?
        } else {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
                .map_err(connect_err)?
        };

        Ok(Self::with_client(config.name.clone(), docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(name: impl Into<String>, docker: Docker) -> Self {
        Self {
            name: name.into(),
            docker,
            debug: false,
        }
    }

    /// Log container output before removing workers.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    fn worker(&self, info: WorkerInfo, launch: Option<Launch>, debug: bool) -> DockerWorker {
        DockerWorker {
            docker: self.docker.clone(),
            info,
            state: WorkerState::Created,
            launch,
            debug,
        }
    }
}

#[async_trait]
impl Provider for DockerCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND_DOCKER
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await.map_err(|e| {
            warn!(cloud = %self.name, error = %e, "Docker ping failed");
            Error::Provision(format!("docker cloud {} unreachable: {}", self.name, e))
        })?;
        Ok(())
    }

    async fn resource(&self) -> Result<Resource> {
        let host = self
            .docker
            .info()
            .await
            .map_err(|e| Error::Provision(format!("Failed to read docker info: {}", e)))?;

        let limit = Quota::new()
            .with(LIMITS_CPU, Quantity::millicores(host.ncpu.unwrap_or(0) * 1000))
            .with(LIMITS_MEMORY, Quantity::bytes(host.mem_total.unwrap_or(0)));

        // Every running container counts, not only workers.
        let running = self
            .docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| Error::Provision(format!("Failed to list containers: {}", e)))?;

        let mut nano_cpus: i128 = 0;
        let mut memory: i64 = 0;
        for container in running {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(detail) => {
                    if let Some(host_config) = detail.host_config {
                        nano_cpus += host_config.nano_cpus.unwrap_or(0) as i128;
                        memory = memory.saturating_add(host_config.memory.unwrap_or(0));
                    }
                }
                // exited between list and inspect
                Err(e) if is_not_found(&e) => continue,
                Err(e) => {
                    return Err(Error::Provision(format!(
                        "Failed to inspect container {}: {}",
                        id, e
                    )));
                }
            }
        }

        let used = Quota::new()
            .with(LIMITS_CPU, Quantity::from_nanos(nano_cpus, Format::DecimalSi))
            .with(LIMITS_MEMORY, Quantity::bytes(memory));

        Ok(Resource { limit, used })
    }

    fn new_worker(
        &self,
        request: &WorkerRequest,
        options: &WorkerOptions,
    ) -> Result<Box<dyn Worker>> {
        let mut info = WorkerInfo::new(request, &self.name, KIND_DOCKER);
        info.quota = request.quota.with_defaults(&options.default_quota);
        let launch = Launch {
            image: image_reference(&options.env.worker_image),
            config: container_config(request, options),
            timeout: options.timeout,
        };
        Ok(Box::new(self.worker(
            info,
            Some(launch),
            self.debug || options.debug,
        )))
    }

    fn load_worker(&self, info: &WorkerInfo) -> Result<Box<dyn Worker>> {
        Ok(Box::new(self.worker(info.clone(), None, self.debug)))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInstance>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}={}", WORKER_LABEL_KEY, WORKER_LABEL_VALUE)],
            )]),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::Provision(format!("Failed to list workers: {}", e)))?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let labels = c.labels.unwrap_or_default();
                WorkerInstance {
                    // docker reports names with a leading slash
                    name: c
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_matches('/').to_string())
                        .unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                    created_at: c.created.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)),
                    event_id: labels.get(EVENT_ID_LABEL).cloned(),
                    project: None,
                    pipeline: None,
                }
            })
            .collect())
    }
}

/// Container CPU (nanocores) and memory (bytes) for a quota, with unset
/// limits taken from `defaults`.
pub fn host_resources(quota: &Quota, defaults: &Quota) -> (i64, i64) {
    let quota = quota.with_defaults(defaults);
    let nano_cpus = quota
        .get_or_zero(LIMITS_CPU)
        .nanos()
        .clamp(0, i64::MAX as i128) as i64;
    let memory = quota.get_or_zero(LIMITS_MEMORY).value().max(0);
    (nano_cpus, memory)
}

/// Container definition for a worker.
pub fn container_config(request: &WorkerRequest, options: &WorkerOptions) -> Config<String> {
    let quota = request.quota.with_defaults(&options.default_quota);
    let (nano_cpus, memory) = host_resources(&quota, &options.default_quota);

    let env = worker_env(&request.event_id, &options.env, &quota, false)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let labels = HashMap::from([
        (WORKER_LABEL_KEY.to_string(), WORKER_LABEL_VALUE.to_string()),
        (EVENT_ID_LABEL.to_string(), request.event_id.to_string()),
    ]);

    let binds = match (&request.cache_volume, &request.mount_path) {
        (Some(volume), Some(path)) => Some(vec![format!("{}:{}:rw", volume, path)]),
        _ => None,
    };

    Config {
        image: Some(image_reference(&options.env.worker_image)),
        env: Some(env),
        working_dir: Some(CLONE_DIR.to_string()),
        labels: Some(labels),
        host_config: Some(HostConfig {
            privileged: Some(true),
            nano_cpus: Some(nano_cpus),
            memory: Some(memory),
            binds,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

struct Launch {
    image: String,
    config: Config<String>,
    timeout: Duration,
}

/// A worker running as a Docker container.
pub struct DockerWorker {
    docker: Docker,
    info: WorkerInfo,
    state: WorkerState,
    launch: Option<Launch>,
    debug: bool,
}

impl DockerWorker {
    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::Provision(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }
        Ok(())
    }

    async fn create_container(&self, launch: &Launch) -> Result<String> {
        let options = || CreateContainerOptions {
            name: self.info.name.clone(),
            platform: None,
        };

        info!(container = %self.info.name, "Creating container");
        let created = match self
            .docker
            .create_container(Some(options()), launch.config.clone())
            .await
        {
            Ok(created) => created,
            Err(e) if is_not_found(&e) => {
                self.pull_image(&launch.image).await?;
                self.docker
                    .create_container(Some(options()), launch.config.clone())
                    .await
                    .map_err(|e| {
                        Error::Provision(format!("Failed to create container: {}", e))
                    })?
            }
            Err(e) => {
                return Err(Error::Provision(format!(
                    "Failed to create container: {}",
                    e
                )));
            }
        };
        Ok(created.id)
    }

    async fn remove(&self, id: &str) -> std::result::Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await
    }

    async fn log_output(&self, id: &str) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(line) = stream.next().await {
            match line {
                Ok(output) => {
                    info!(container = %self.info.name, "{}", output.to_string().trim_end())
                }
                Err(e) => {
                    warn!(container = %self.info.name, error = %e, "Log stream error");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Worker for DockerWorker {
    fn info(&self) -> &WorkerInfo {
        &self.info
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    async fn start(&mut self) -> Result<()> {
        let launch = self.launch.take().ok_or_else(|| {
            Error::InvalidInput(format!("worker {} was not built for provisioning", self.info.name))
        })?;
        self.state = WorkerState::Starting;

        let id = self.create_container(&launch).await?;

        info!(container = %self.info.name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(re) = self.remove(&id).await {
                warn!(container = %self.info.name, error = %re, "Failed to remove unstarted container");
            }
            return Err(Error::Provision(format!("Failed to start container: {}", e)));
        }

        self.info.handle = Some(id);
        self.info.stamp(Utc::now(), launch.timeout);
        self.state = WorkerState::Running;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(id) = self.info.handle.clone() else {
            debug!(worker = %self.info.name, "No container to remove");
            self.state = WorkerState::Terminated;
            return Ok(());
        };

        if self.debug {
            self.log_output(&id).await;
        }

        match self.remove(&id).await {
            Ok(()) => info!(container = %self.info.name, "Removed container"),
            Err(e) if is_not_found(&e) => {
                debug!(container = %self.info.name, "Container already removed")
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "Failed to remove container {}: {}",
                    id, e
                )));
            }
        }
        self.state = WorkerState::Terminated;
        Ok(())
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use cyclone_core::EventId;

    fn local() -> DockerCloud {
        DockerCloud::new(&CloudConfig::docker("local", "unix:///var/run/docker.sock")).unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_ping_and_resource() {
        let cloud = local();
        cloud.ping().await.expect("Should reach Docker daemon");

        let resource = cloud.resource().await.unwrap();
        assert!(!resource.limit.is_zero());
    }

    #[tokio::test]
    #[ignore]
    async fn test_provision_and_terminate() {
        let cloud = local();
        let options = WorkerOptions {
            env: cyclone_core::WorkerEnv {
                worker_image: "alpine:latest".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let request = WorkerRequest::new(EventId::new());

        let info = cloud
            .provision(&request, &options)
            .await
            .expect("Should provision container");
        assert!(info.handle.is_some());
        assert!(info.due_time.is_some());

        let workers = cloud.list_workers().await.unwrap();
        assert!(workers.iter().any(|w| w.name == info.name));

        cloud.terminate_worker(&info).await.unwrap();
        // second removal is a no-op
        cloud.terminate_worker(&info).await.unwrap();
    }
}
