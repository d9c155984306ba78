//! Kubernetes cloud implementation.
//!
//! Workers are bare pods in the cloud's namespace. Capacity comes from the
//! namespace's first `ResourceQuota`; a namespace without one is unmetered.

use async_trait::async_trait;
use cyclone_core::provider::KIND_KUBERNETES;
use cyclone_core::quota::LIMITS_CPU;
use cyclone_core::worker::{EVENT_ID_LABEL, WORKER_LABEL_KEY, WORKER_LABEL_VALUE};
use cyclone_core::{
    CloudConfig, Error, Provider, Quantity, Quota, Resource, Result, Worker, WorkerInfo, WorkerInstance,
    WorkerOptions, WorkerRequest, WorkerState,
};
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, Namespace, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, ResourceQuota, ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as KubeQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Config};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::env::{CLONE_DIR, image_reference, worker_env};

const CONTAINER_NAME: &str = "cyclone-worker";
const CACHE_VOLUME_NAME: &str = "cache-dependency";

const PROJECT_ANNOTATION: &str = "cyclone/projectName";
const PIPELINE_ANNOTATION: &str = "cyclone/pipelineName";
const RECORD_ANNOTATION: &str = "cyclone/recordID";

/// A Kubernetes namespace used as a cloud.
pub struct KubernetesCloud {
    name: String,
    client: Client,
    namespace: String,
}

impl KubernetesCloud {
    /// Build a client for the cluster described by `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let settings = config.kubernetes_settings()?;

        let kube_config = if settings.in_cluster {
            Config::incluster()
                .map_err(|e| Error::Config(format!("in-cluster config unavailable: {}", e)))?
        } else {
            let mut kube_config = Config::new(settings.host.parse().map_err(|e| {
                Error::Config(format!("invalid kubernetes host {}: {}", settings.host, e))
            })?);
            kube_config.accept_invalid_certs = config.insecure;
            if let Some(token) = settings.bearer_token.as_ref().filter(|t| !t.is_empty()) {
                kube_config.auth_info.token = Some(token.clone().into());
            }
            kube_config
        };

        let namespace = if settings.namespace.is_empty() {
            kube_config.default_namespace.clone()
        } else {
            settings.namespace.clone()
        };

        let client = Client::try_from(kube_config)
            .map_err(|e| Error::Config(format!("cannot build kubernetes client: {}", e)))?;

        Ok(Self::with_client(config.name.clone(), client, namespace))
    }

    pub fn with_client(name: impl Into<String>, client: Client, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl Provider for KubernetesCloud {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        KIND_KUBERNETES
    }

    async fn ping(&self) -> Result<()> {
        self.pods()
            .list(&ListParams::default().limit(1))
            .await
            .map_err(|e| {
                warn!(cloud = %self.name, error = %e, "Kubernetes ping failed");
                Error::Provision(format!("kubernetes cloud {} unreachable: {}", self.name, e))
            })?;
        Ok(())
    }

    async fn resource(&self) -> Result<Resource> {
        let quotas: Api<ResourceQuota> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = quotas
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::Provision(format!("Failed to list resource quotas: {}", e)))?;

        let Some(quota) = list.items.into_iter().next() else {
            return Ok(Resource::new());
        };
        let status = quota.status.unwrap_or_default();
        Ok(Resource {
            limit: from_kube_quota(status.hard)?,
            used: from_kube_quota(status.used)?,
        })
    }

    fn new_worker(
        &self,
        request: &WorkerRequest,
        options: &WorkerOptions,
    ) -> Result<Box<dyn Worker>> {
        let mut info = WorkerInfo::new(request, &self.name, KIND_KUBERNETES);
        info.quota = request.quota.with_defaults(&options.default_quota);
        Ok(Box::new(PodWorker {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            info,
            state: WorkerState::Created,
            launch: Some(PodLaunch {
                request: request.clone(),
                options: options.clone(),
            }),
        }))
    }

    fn load_worker(&self, info: &WorkerInfo) -> Result<Box<dyn Worker>> {
        Ok(Box::new(PodWorker {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            info: info.clone(),
            state: WorkerState::Running,
            launch: None,
        }))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInstance>> {
        let selector = format!("{}={}", WORKER_LABEL_KEY, WORKER_LABEL_VALUE);
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::Provision(format!("Failed to list worker pods: {}", e)))?;

        Ok(pods
            .items
            .into_iter()
            .map(|pod| {
                let labels = pod.metadata.labels.unwrap_or_default();
                let annotations = pod.metadata.annotations.unwrap_or_default();
                WorkerInstance {
                    name: pod.metadata.name.unwrap_or_default(),
                    status: pod.status.and_then(|s| s.phase).unwrap_or_default(),
                    created_at: pod.metadata.creation_timestamp.map(|t| t.0),
                    event_id: labels.get(EVENT_ID_LABEL).cloned(),
                    project: annotations.get(PROJECT_ANNOTATION).cloned(),
                    pipeline: annotations.get(PIPELINE_ANNOTATION).cloned(),
                }
            })
            .collect())
    }
}

fn from_kube_quota(entries: Option<BTreeMap<String, KubeQuantity>>) -> Result<Quota> {
    entries
        .unwrap_or_default()
        .into_iter()
        .map(|(name, quantity)| quantity.0.parse::<Quantity>().map(|q| (name, q)))
        .collect()
}

/// Pod resource requirements for a quota, with unset limits taken from
/// `defaults`. `requests.*` entries become requests; everything else limits.
pub fn resource_requirements(quota: &Quota, defaults: &Quota) -> ResourceRequirements {
    let mut limits = BTreeMap::new();
    let mut requests = BTreeMap::new();

    for (name, quantity) in quota.with_defaults(defaults).iter() {
        let value = KubeQuantity(quantity.to_string());
        if let Some(resource) = name.strip_prefix("requests.") {
            requests.insert(resource.to_string(), value);
        } else {
            let resource = name.strip_prefix("limits.").unwrap_or(name);
            limits.insert(resource.to_string(), value);
        }
    }

    ResourceRequirements {
        limits: (!limits.is_empty()).then_some(limits),
        requests: (!requests.is_empty()).then_some(requests),
        ..Default::default()
    }
}

/// Pod definition for a worker. `cache` is a bound claim and its mount path.
pub fn pod_manifest(
    request: &WorkerRequest,
    options: &WorkerOptions,
    namespace: &str,
    cache: Option<(&str, &str)>,
) -> Pod {
    let quota = request.quota.with_defaults(&options.default_quota);
    let event_id = request.event_id.to_string();

    let labels = BTreeMap::from([
        (WORKER_LABEL_KEY.to_string(), WORKER_LABEL_VALUE.to_string()),
        (EVENT_ID_LABEL.to_string(), event_id.clone()),
    ]);
    let annotations = BTreeMap::from([
        (PROJECT_ANNOTATION.to_string(), request.project.clone().unwrap_or_default()),
        (PIPELINE_ANNOTATION.to_string(), request.pipeline.clone().unwrap_or_default()),
        (
            RECORD_ANNOTATION.to_string(),
            request.record_id.clone().unwrap_or(event_id),
        ),
    ]);

    let env = worker_env(&request.event_id, &options.env, &quota, true)
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let (volumes, volume_mounts) = match cache {
        Some((claim, mount_path)) => (
            Some(vec![Volume {
                name: CACHE_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            Some(vec![VolumeMount {
                name: CACHE_VOLUME_NAME.to_string(),
                mount_path: mount_path.to_string(),
                ..Default::default()
            }]),
        ),
        None => (None, None),
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(image_reference(&options.env.worker_image)),
                env: Some(env),
                working_dir: Some(CLONE_DIR.to_string()),
                resources: Some(resource_requirements(&quota, &options.default_quota)),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                image_pull_policy: Some("Always".to_string()),
                volume_mounts,
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            volumes,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `Ok(true)` once running, `Ok(false)` while pending, error for any other phase.
fn pod_running(phase: Option<&str>) -> Result<bool> {
    match phase {
        Some("Running") => Ok(true),
        Some("Pending") | None => Ok(false),
        Some(other) => Err(Error::Provision(format!(
            "worker pod entered phase {}",
            other
        ))),
    }
}

async fn wait_for_running(
    pods: &Api<Pod>,
    name: &str,
    interval: Duration,
    ceiling: Duration,
) -> Result<()> {
    let poll = async {
        loop {
            tokio::time::sleep(interval).await;
            let pod = pods
                .get(name)
                .await
                .map_err(|e| Error::Provision(format!("Failed to get pod {}: {}", name, e)))?;
            let phase = pod.status.and_then(|s| s.phase);
            if pod_running(phase.as_deref())? {
                return Ok(());
            }
            debug!(pod = %name, "Waiting for pod to run");
        }
    };

    tokio::time::timeout(ceiling, poll).await.map_err(|_| {
        Error::Timeout(format!("pod {} not running after {:?}", name, ceiling))
    })?
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

struct PodLaunch {
    request: WorkerRequest,
    options: WorkerOptions,
}

/// A worker running as a pod.
pub struct PodWorker {
    client: Client,
    /// Cloud namespace, used when the request names none or a missing one.
    namespace: String,
    info: WorkerInfo,
    state: WorkerState,
    launch: Option<PodLaunch>,
}

impl PodWorker {
    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn resolve_namespace(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested.filter(|ns| !ns.is_empty() && *ns != self.namespace)
        else {
            return self.namespace.clone();
        };

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.get_opt(requested).await {
            Ok(Some(_)) => requested.to_string(),
            Ok(None) => {
                warn!(namespace = %requested, fallback = %self.namespace, "Namespace not found, using cloud namespace");
                self.namespace.clone()
            }
            Err(e) => {
                warn!(namespace = %requested, error = %e, "Failed to look up namespace, using cloud namespace");
                self.namespace.clone()
            }
        }
    }

    /// The cache claim if it exists and is bound. Any problem degrades to an
    /// uncached run.
    async fn cache_binding(&self, namespace: &str) -> Option<(String, String)> {
        let (claim, mount_path) = match (&self.info.cache_volume, &self.info.mount_path) {
            (Some(claim), Some(path)) if !claim.is_empty() && !path.is_empty() => (claim, path),
            _ => return None,
        };

        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match claims.get_opt(claim).await {
            Ok(Some(pvc)) => {
                let phase = pvc.status.and_then(|s| s.phase);
                if phase.as_deref() == Some("Bound") {
                    Some((claim.clone(), mount_path.clone()))
                } else {
                    warn!(volume = %claim, phase = ?phase, "Cache volume not bound, running without cache");
                    None
                }
            }
            Ok(None) => {
                warn!(volume = %claim, "Cache volume not found, running without cache");
                None
            }
            Err(e) => {
                warn!(volume = %claim, error = %e, "Failed to get cache volume, running without cache");
                None
            }
        }
    }
}

#[async_trait]
impl Worker for PodWorker {
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

        let namespace = self
            .resolve_namespace(launch.request.namespace.as_deref())
            .await;
        self.info.namespace = Some(namespace.clone());

        let cache = self.cache_binding(&namespace).await;
        if cache.is_none() {
            self.info.cache_volume = None;
            self.info.mount_path = None;
        }

        let pod = pod_manifest(
            &launch.request,
            &launch.options,
            &namespace,
            cache.as_ref().map(|(c, p)| (c.as_str(), p.as_str())),
        );

        let pods = self.pods(&namespace);
        info!(
            pod = %self.info.name,
            namespace = %namespace,
            cpu = %self.info.quota.get_or_zero(LIMITS_CPU),
            "Creating worker pod"
        );
        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(|e| Error::Provision(format!("Failed to create pod: {}", e)))?;
        self.info.handle = Some(self.info.name.clone());

        if let Err(e) = wait_for_running(
            &pods,
            &self.info.name,
            launch.options.ready_poll_interval,
            launch.options.ready_timeout,
        )
        .await
        {
            warn!(pod = %self.info.name, error = %e, "Worker pod did not start, deleting");
            if let Err(de) = pods.delete(&self.info.name, &DeleteParams::default()).await {
                warn!(pod = %self.info.name, error = %de, "Failed to delete worker pod");
            }
            self.info.handle = None;
            return Err(e);
        }

        self.info.stamp(Utc::now(), launch.options.timeout);
        self.state = WorkerState::Running;
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(name) = self.info.handle.clone() else {
            debug!(worker = %self.info.name, "No pod to delete");
            self.state = WorkerState::Terminated;
            return Ok(());
        };
        let namespace = self
            .info
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());

        match self
            .pods(&namespace)
            .delete(&name, &DeleteParams::default().grace_period(0))
            .await
        {
            Ok(_) => info!(pod = %name, namespace = %namespace, "Deleted worker pod"),
            Err(e) if is_not_found(&e) => debug!(pod = %name, "Worker pod already deleted"),
            Err(e) => {
                return Err(Error::Internal(format!("Failed to delete pod {}: {}", name, e)));
            }
        }
        self.state = WorkerState::Terminated;
        Ok(())
    }
}


/// Provider tests against an in-process stand-in for the Kubernetes API.
#[cfg(test)]
mod api_tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use cyclone_core::quota::LIMITS_MEMORY;
    use cyclone_core::{EventId, KubernetesSettings};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Cluster {
        quotas: Vec<Value>,
        /// Phases reported by successive pod reads; the last one sticks.
        phases: Mutex<VecDeque<&'static str>>,
        claim_phase: Option<&'static str>,
        created: Mutex<Vec<Value>>,
        deleted: Mutex<Vec<String>>,
    }

    impl Cluster {
        fn with_phases(phases: &[&'static str]) -> Self {
            Self {
                phases: Mutex::new(phases.iter().copied().collect()),
                ..Default::default()
            }
        }

        fn created(&self) -> Vec<Value> {
            self.created.lock().unwrap().clone()
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    type Shared = Arc<Cluster>;

    fn not_found(name: &str) -> Response {
        let status = json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": format!("{} not found", name),
            "reason": "NotFound",
            "code": 404,
        });
        (StatusCode::NOT_FOUND, Json(status)).into_response()
    }

    fn pod(namespace: &str, name: &str, phase: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": namespace },
            "status": { "phase": phase },
        })
    }

    async fn get_namespace(Path(ns): Path<String>) -> Response {
        if ns == "ci" {
            Json(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": ns } }))
                .into_response()
        } else {
            not_found(&ns)
        }
    }

    async fn list_quotas(State(cluster): State<Shared>) -> Json<Value> {
        Json(json!({
            "apiVersion": "v1",
            "kind": "ResourceQuotaList",
            "metadata": {},
            "items": cluster.quotas,
        }))
    }

    async fn create_pod(State(cluster): State<Shared>, Json(mut body): Json<Value>) -> Response {
        cluster.created.lock().unwrap().push(body.clone());
        body["status"] = json!({ "phase": "Pending" });
        (StatusCode::CREATED, Json(body)).into_response()
    }

    async fn get_pod(
        State(cluster): State<Shared>,
        Path((ns, name)): Path<(String, String)>,
    ) -> Response {
        let mut phases = cluster.phases.lock().unwrap();
        let phase = if phases.len() > 1 {
            phases.pop_front()
        } else {
            phases.front().copied()
        };
        match phase {
            Some(phase) => Json(pod(&ns, &name, phase)).into_response(),
            None => not_found(&name),
        }
    }

    async fn delete_pod(
        State(cluster): State<Shared>,
        Path((ns, name)): Path<(String, String)>,
    ) -> Response {
        let exists = cluster
            .created
            .lock()
            .unwrap()
            .iter()
            .any(|p| p["metadata"]["name"] == name.as_str());
        if !exists {
            return not_found(&name);
        }
        cluster.deleted.lock().unwrap().push(name.clone());
        Json(pod(&ns, &name, "Running")).into_response()
    }

    async fn get_claim(
        State(cluster): State<Shared>,
        Path((_ns, name)): Path<(String, String)>,
    ) -> Response {
        match cluster.claim_phase {
            Some(phase) => Json(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": name },
                "status": { "phase": phase },
            }))
            .into_response(),
            None => not_found(&name),
        }
    }

    async fn serve(cluster: Shared) -> KubernetesCloud {
        let app = Router::new()
            .route("/api/v1/namespaces/{ns}", get(get_namespace))
            .route("/api/v1/namespaces/{ns}/resourcequotas", get(list_quotas))
            .route("/api/v1/namespaces/{ns}/pods", post(create_pod))
            .route(
                "/api/v1/namespaces/{ns}/pods/{name}",
                get(get_pod).delete(delete_pod),
            )
            .route(
                "/api/v1/namespaces/{ns}/persistentvolumeclaims/{name}",
                get(get_claim),
            )
            .with_state(cluster);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = CloudConfig::kubernetes(
            "k8s",
            KubernetesSettings {
                host: format!("http://{}", addr),
                namespace: "ci".to_string(),
                ..Default::default()
            },
        );
        KubernetesCloud::new(&config).unwrap()
    }

    fn compute_quota(cpu_used: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ResourceQuota",
            "metadata": { "name": "compute", "namespace": "ci" },
            "status": {
                "hard": { "limits.cpu": "2", "limits.memory": "4Gi" },
                "used": { "limits.cpu": cpu_used, "limits.memory": "1Gi" },
            },
        })
    }

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            ready_poll_interval: Duration::from_millis(10),
            ready_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn half_cpu_request() -> WorkerRequest {
        let mut request = WorkerRequest::new(EventId::new()).with_quota(
            Quota::new()
                .with(LIMITS_CPU, "0.5".parse().unwrap())
                .with(LIMITS_MEMORY, "512Mi".parse().unwrap()),
        );
        request.project = Some("web".to_string());
        request
    }

    #[tokio::test]
    async fn test_resource_reads_first_quota() {
        let mut second = compute_quota("0");
        second["status"]["hard"]["limits.cpu"] = json!("100");
        let cluster = Arc::new(Cluster {
            quotas: vec![compute_quota("1.5"), second],
            ..Default::default()
        });
        let cloud = serve(cluster).await;

        let resource = cloud.resource().await.unwrap();
        assert_eq!(resource.limit.get_or_zero(LIMITS_CPU), "2".parse::<Quantity>().unwrap());
        assert_eq!(resource.used.get_or_zero(LIMITS_CPU), "1.5".parse::<Quantity>().unwrap());
        assert_eq!(resource.limit.get_or_zero(LIMITS_MEMORY), "4Gi".parse::<Quantity>().unwrap());
        assert_eq!(resource.used.get_or_zero(LIMITS_MEMORY), "1Gi".parse::<Quantity>().unwrap());
    }

    #[tokio::test]
    async fn test_namespace_without_quota_is_unmetered() {
        let cloud = serve(Arc::new(Cluster::default())).await;
        let resource = cloud.resource().await.unwrap();
        assert!(resource.limit.is_zero());

        let huge = Quota::new().with(LIMITS_CPU, "64".parse().unwrap());
        assert!(cloud.can_provision(&huge).await.unwrap());
    }

    #[tokio::test]
    async fn test_provision_creates_pod_and_waits_for_running() {
        let cluster = Arc::new(Cluster {
            quotas: vec![compute_quota("1.5")],
            ..Cluster::with_phases(&["Pending", "Running"])
        });
        let cloud = serve(cluster.clone()).await;
        let request = half_cpu_request();

        let info = cloud.provision(&request, &fast_options()).await.unwrap();
        assert_eq!(info.cloud_name, "k8s");
        assert_eq!(info.handle.as_deref(), Some(request.name.as_str()));
        assert_eq!(info.namespace.as_deref(), Some("ci"));
        assert!(info.due_time.is_some());

        let created = cluster.created();
        assert_eq!(created.len(), 1);
        let pod = &created[0];
        assert_eq!(pod["metadata"]["name"], request.name.as_str());
        assert_eq!(pod["metadata"]["labels"]["cyclone"], "worker");
        assert_eq!(pod["metadata"]["labels"]["cyclone/id"], request.event_id.to_string());
        assert_eq!(pod["metadata"]["annotations"][PROJECT_ANNOTATION], "web");
        let limits = &pod["spec"]["containers"][0]["resources"]["limits"];
        assert_eq!(limits["cpu"], "500m");
        assert_eq!(limits["memory"], "512Mi");
        assert!(cluster.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_provision_without_headroom_creates_nothing() {
        let cluster = Arc::new(Cluster {
            quotas: vec![compute_quota("1.7")],
            ..Cluster::with_phases(&["Running"])
        });
        let cloud = serve(cluster.clone()).await;

        let err = cloud
            .provision(&half_cpu_request(), &fast_options())
            .await
            .unwrap_err();
        assert!(err.is_insufficient_resource());
        assert!(cluster.created().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pod_is_deleted() {
        let cluster = Arc::new(Cluster::with_phases(&["Failed"]));
        let cloud = serve(cluster.clone()).await;
        let request = half_cpu_request();

        let err = cloud.provision(&request, &fast_options()).await.unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
        assert_eq!(cluster.deleted(), vec![request.name]);
    }

    #[tokio::test]
    async fn test_pod_stuck_pending_times_out() {
        let cluster = Arc::new(Cluster::with_phases(&["Pending"]));
        let cloud = serve(cluster.clone()).await;
        let request = half_cpu_request();
        let options = WorkerOptions {
            ready_timeout: Duration::from_millis(100),
            ..fast_options()
        };

        let err = cloud.provision(&request, &options).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(cluster.deleted(), vec![request.name]);
    }

    #[tokio::test]
    async fn test_unbound_cache_runs_uncached() {
        let cluster = Arc::new(Cluster {
            claim_phase: Some("Pending"),
            ..Cluster::with_phases(&["Running"])
        });
        let cloud = serve(cluster.clone()).await;
        let mut request = half_cpu_request();
        request.cache_volume = Some("maven-cache".to_string());
        request.mount_path = Some("/root/.m2".to_string());

        let info = cloud.provision(&request, &fast_options()).await.unwrap();
        assert!(info.cache_volume.is_none());
        assert!(info.mount_path.is_none());
        assert!(cluster.created()[0]["spec"]["volumes"].is_null());
    }

    #[tokio::test]
    async fn test_bound_cache_is_mounted() {
        let cluster = Arc::new(Cluster {
            claim_phase: Some("Bound"),
            ..Cluster::with_phases(&["Running"])
        });
        let cloud = serve(cluster.clone()).await;
        let mut request = half_cpu_request();
        request.cache_volume = Some("maven-cache".to_string());
        request.mount_path = Some("/root/.m2".to_string());

        let info = cloud.provision(&request, &fast_options()).await.unwrap();
        assert_eq!(info.cache_volume.as_deref(), Some("maven-cache"));
        let spec = &cluster.created()[0]["spec"];
        assert_eq!(spec["volumes"][0]["persistentVolumeClaim"]["claimName"], "maven-cache");
        assert_eq!(spec["containers"][0]["volumeMounts"][0]["mountPath"], "/root/.m2");
    }

    #[tokio::test]
    async fn test_missing_namespace_falls_back() {
        let cluster = Arc::new(Cluster::with_phases(&["Running"]));
        let cloud = serve(cluster.clone()).await;
        let mut request = half_cpu_request();
        request.namespace = Some("missing".to_string());

        let info = cloud.provision(&request, &fast_options()).await.unwrap();
        assert_eq!(info.namespace.as_deref(), Some("ci"));
        assert_eq!(cluster.created()[0]["metadata"]["namespace"], "ci");
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let cluster = Arc::new(Cluster::with_phases(&["Running"]));
        let cloud = serve(cluster.clone()).await;

        let info = cloud
            .provision(&half_cpu_request(), &fast_options())
            .await
            .unwrap();
        cloud.terminate_worker(&info).await.unwrap();
        assert_eq!(cluster.deleted(), vec![info.name.clone()]);

        // a pod that is already gone
        let mut gone = info.clone();
        gone.handle = Some("cyclone-worker-gone".to_string());
        let mut worker = cloud.load_worker(&gone).unwrap();
        worker.terminate().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Terminated);
        assert_eq!(cluster.deleted().len(), 1);
    }
}
