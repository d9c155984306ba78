//! Cloud controller: the registered clouds and failover provisioning.

use cyclone_core::{
    CloudConfig, CloudProvisionError, Error, Provider, Resource, Result, Worker, WorkerInfo,
    WorkerInstance, WorkerOptions, WorkerRequest,
};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::registry::ProviderRegistry;

/// Key of the aggregate entry in [`CloudController::resources`].
pub const TOTAL_RESOURCE: &str = "_total";

/// Holds the live providers, in registration order.
///
/// Registration order is failover priority: `provision` tries clouds first
/// to last and returns the first success.
pub struct CloudController {
    registry: ProviderRegistry,
    options: WorkerOptions,
    clouds: RwLock<IndexMap<String, Arc<dyn Provider>>>,
}

impl CloudController {
    pub fn new(registry: ProviderRegistry, options: WorkerOptions) -> Self {
        Self {
            registry,
            options,
            clouds: RwLock::new(IndexMap::new()),
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Build a provider from `config` and register it under its name.
    pub async fn add_cloud(&self, config: &CloudConfig) -> Result<()> {
        if self.clouds.read().await.contains_key(&config.name) {
            return Err(Error::Conflict(format!("cloud {} already exists", config.name)));
        }
        let provider = self.registry.build(config, &self.options)?;
        self.add_provider(provider).await
    }

    pub async fn add_clouds(&self, configs: &[CloudConfig]) -> Result<()> {
        for config in configs {
            self.add_cloud(config).await?;
        }
        Ok(())
    }

    /// Register an already constructed provider.
    pub async fn add_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let mut clouds = self.clouds.write().await;
        let name = provider.name().to_string();
        if clouds.contains_key(&name) {
            return Err(Error::Conflict(format!("cloud {} already exists", name)));
        }
        info!(cloud = %name, kind = provider.kind(), "Registered cloud");
        clouds.insert(name, provider);
        Ok(())
    }

    pub async fn get_cloud(&self, name: &str) -> Result<Arc<dyn Provider>> {
        self.clouds
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cloud {}", name)))
    }

    pub async fn delete_cloud(&self, name: &str) -> Result<()> {
        match self.clouds.write().await.shift_remove(name) {
            Some(_) => {
                info!(cloud = %name, "Removed cloud");
                Ok(())
            }
            None => Err(Error::NotFound(format!("cloud {}", name))),
        }
    }

    pub async fn cloud_names(&self) -> Vec<String> {
        self.clouds.read().await.keys().cloned().collect()
    }

    pub async fn ping(&self, name: &str) -> Result<()> {
        self.get_cloud(name).await?.ping().await
    }

    /// Snapshot of the providers so no lock is held across backend calls.
    async fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.clouds.read().await.values().cloned().collect()
    }

    /// Resource of every cloud plus their sum under [`TOTAL_RESOURCE`].
    pub async fn resources(&self) -> Result<IndexMap<String, Resource>> {
        let mut resources = IndexMap::new();
        let mut total = Resource::new();
        for provider in self.providers().await {
            let resource = provider.resource().await?;
            total.add(&resource);
            resources.insert(provider.name().to_string(), resource);
        }
        resources.insert(TOTAL_RESOURCE.to_string(), total);
        Ok(resources)
    }

    /// Provision a worker on the first cloud that accepts it.
    ///
    /// A zero quota is replaced by the default quota. When every cloud fails,
    /// the error is an aggregate of the per-cloud errors, which
    /// [`Error::is_all_clouds_busy`] classifies.
    pub async fn provision(&self, request: &WorkerRequest) -> Result<WorkerInfo> {
        let mut request = request.clone();
        if request.quota.is_zero() {
            request.quota = self.options.default_quota.clone();
        }

        let providers = self.providers().await;
        if providers.is_empty() {
            return Err(Error::Config("no cloud registered".to_string()));
        }

        let mut errors = CloudProvisionError::new();
        for provider in providers {
            debug!(cloud = %provider.name(), event_id = %request.event_id, "Trying cloud");
            match provider.provision(&request, &self.options).await {
                Ok(info) => {
                    info!(
                        cloud = %provider.name(),
                        event_id = %request.event_id,
                        worker = %info.name,
                        "Provisioned worker"
                    );
                    return Ok(info);
                }
                Err(e) => {
                    warn!(cloud = %provider.name(), event_id = %request.event_id, error = %e, "Cloud could not provision worker");
                    errors.add(provider.name(), e);
                }
            }
        }

        Err(errors.into())
    }

    pub async fn load_worker(&self, info: &WorkerInfo) -> Result<Box<dyn Worker>> {
        self.get_cloud(&info.cloud_name).await?.load_worker(info)
    }

    pub async fn terminate_worker(&self, info: &WorkerInfo) -> Result<()> {
        self.get_cloud(&info.cloud_name)
            .await?
            .terminate_worker(info)
            .await
    }

    /// Labelled workers per cloud.
    pub async fn list_workers(&self) -> Result<IndexMap<String, Vec<WorkerInstance>>> {
        let mut workers = IndexMap::new();
        for provider in self.providers().await {
            workers.insert(provider.name().to_string(), provider.list_workers().await?);
        }
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, MockCloud};
    use cyclone_core::quota::{LIMITS_CPU, LIMITS_MEMORY, default_quota};
    use cyclone_core::{EventId, Quantity, Quota};

    fn controller() -> CloudController {
        CloudController::new(ProviderRegistry::empty(), WorkerOptions::default())
    }

    async fn with_clouds(clouds: Vec<Arc<MockCloud>>) -> CloudController {
        let controller = controller();
        for cloud in clouds {
            controller.add_provider(cloud).await.unwrap();
        }
        controller
    }

    fn request() -> WorkerRequest {
        WorkerRequest::new(EventId::new())
    }

    fn cpu(limit: &str, used: &str) -> Resource {
        Resource {
            limit: Quota::new().with(LIMITS_CPU, limit.parse().unwrap()),
            used: Quota::new().with(LIMITS_CPU, used.parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_failover_to_first_success() {
        let a = Arc::new(MockCloud::new("a", Behavior::Busy));
        let b = Arc::new(MockCloud::new("b", Behavior::Busy));
        let c = Arc::new(MockCloud::new("c", Behavior::Provision));
        let d = Arc::new(MockCloud::new("d", Behavior::Provision));
        let controller = with_clouds(vec![a.clone(), b.clone(), c.clone(), d.clone()]).await;

        let info = controller.provision(&request()).await.unwrap();
        assert_eq!(info.cloud_name, "c");
        assert_eq!(a.admission_checks(), 1);
        assert_eq!(b.admission_checks(), 1);
        assert!(a.requests().is_empty());
        assert_eq!(c.requests().len(), 1);
        assert_eq!(d.admission_checks(), 0);
    }

    #[tokio::test]
    async fn test_provision_checks_admission_before_building() {
        let tight = MockCloud::new("tight", Behavior::Provision).with_resource(cpu("2", "1.7"));
        let request = request().with_quota(Quota::new().with(LIMITS_CPU, "0.5".parse().unwrap()));

        let err = tight
            .provision(&request, &WorkerOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_insufficient_resource());
        assert_eq!(tight.admission_checks(), 1);
        assert!(tight.requests().is_empty());

        let fits = request.clone().with_quota(Quota::new().with(LIMITS_CPU, "0.3".parse().unwrap()));
        let info = tight.provision(&fits, &WorkerOptions::default()).await.unwrap();
        assert_eq!(info.cloud_name, "tight");
        assert_eq!(tight.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_all_busy_is_classified_busy() {
        let controller = with_clouds(vec![
            Arc::new(MockCloud::new("a", Behavior::Busy)),
            Arc::new(MockCloud::new("b", Behavior::Busy)),
        ])
        .await;

        let err = controller.provision(&request()).await.unwrap_err();
        assert!(err.is_all_clouds_busy());
        match err {
            Error::AllCloudsFailed(agg) => {
                assert_eq!(agg.len(), 2);
                assert!(agg.get("a").unwrap().is_insufficient_resource());
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hard_failure_is_not_busy() {
        let controller = with_clouds(vec![
            Arc::new(MockCloud::new("a", Behavior::Busy)),
            Arc::new(MockCloud::new("b", Behavior::Fail("connection refused".to_string()))),
            Arc::new(MockCloud::new("c", Behavior::Busy)),
        ])
        .await;

        let err = controller.provision(&request()).await.unwrap_err();
        assert!(!err.is_all_clouds_busy());
        assert!(err.to_string().contains("b: provisioning failed: connection refused"));
    }

    #[tokio::test]
    async fn test_aggregate_is_fresh_per_call() {
        let a = Arc::new(MockCloud::new("a", Behavior::Fail("boom".to_string())));
        let controller = with_clouds(vec![a.clone()]).await;
        assert!(!controller.provision(&request()).await.unwrap_err().is_all_clouds_busy());

        a.set_behavior(Behavior::Busy);
        assert!(controller.provision(&request()).await.unwrap_err().is_all_clouds_busy());
    }

    #[tokio::test]
    async fn test_no_clouds_is_config_error() {
        let err = controller().provision(&request()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_all_clouds_busy());
    }

    #[tokio::test]
    async fn test_zero_quota_uses_default() {
        let a = Arc::new(MockCloud::new("a", Behavior::Provision));
        let controller = with_clouds(vec![a.clone()]).await;

        controller.provision(&request()).await.unwrap();
        assert_eq!(a.requests()[0].quota, default_quota());

        let custom = Quota::new().with(LIMITS_MEMORY, "1Gi".parse().unwrap());
        controller
            .provision(&request().with_quota(custom.clone()))
            .await
            .unwrap();
        assert_eq!(a.requests()[1].quota, custom);
    }

    #[tokio::test]
    async fn test_admission_uses_headroom() {
        let tight = Arc::new(MockCloud::new("tight", Behavior::Provision).with_resource(cpu("2", "1.7")));
        let roomy = Arc::new(MockCloud::new("roomy", Behavior::Provision).with_resource(cpu("8", "1")));
        let controller = with_clouds(vec![tight.clone(), roomy]).await;

        let request = request().with_quota(Quota::new().with(LIMITS_CPU, "0.5".parse().unwrap()));
        let info = controller.provision(&request).await.unwrap();
        assert_eq!(info.cloud_name, "roomy");
        assert!(info.due_time.is_some());
        assert!(tight.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resources_include_total() {
        let controller = with_clouds(vec![
            Arc::new(MockCloud::new("a", Behavior::Provision).with_resource(cpu("2", "1"))),
            Arc::new(MockCloud::new("b", Behavior::Provision).with_resource(cpu("4", "0.5"))),
        ])
        .await;

        let resources = controller.resources().await.unwrap();
        assert_eq!(resources.keys().collect::<Vec<_>>(), vec!["a", "b", TOTAL_RESOURCE]);
        let total = &resources[TOTAL_RESOURCE];
        assert_eq!(total.limit.get_or_zero(LIMITS_CPU), "6".parse::<Quantity>().unwrap());
        assert_eq!(total.used.get_or_zero(LIMITS_CPU), "1.5".parse::<Quantity>().unwrap());
    }

    #[tokio::test]
    async fn test_cloud_administration() {
        let controller = with_clouds(vec![Arc::new(MockCloud::new("a", Behavior::Provision))]).await;

        let dup = controller
            .add_provider(Arc::new(MockCloud::new("a", Behavior::Busy)))
            .await;
        assert!(matches!(dup, Err(Error::Conflict(_))));

        controller
            .add_provider(Arc::new(MockCloud::new("b", Behavior::Provision)))
            .await
            .unwrap();
        assert_eq!(controller.cloud_names().await, vec!["a", "b"]);
        controller.ping("a").await.unwrap();

        controller.delete_cloud("a").await.unwrap();
        assert_eq!(controller.cloud_names().await, vec!["b"]);
        assert!(matches!(controller.delete_cloud("a").await, Err(Error::NotFound(_))));
        assert!(matches!(controller.ping("a").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_terminate_routes_to_owning_cloud() {
        let a = Arc::new(MockCloud::new("a", Behavior::Busy));
        let b = Arc::new(MockCloud::new("b", Behavior::Provision));
        let controller = with_clouds(vec![a.clone(), b.clone()]).await;

        let info = controller.provision(&request()).await.unwrap();
        assert_eq!(controller.list_workers().await.unwrap()["b"].len(), 1);

        controller.terminate_worker(&info).await.unwrap();
        assert_eq!(b.terminated(), vec![info.event_id]);
        assert!(a.terminated().is_empty());

        let mut orphan = info.clone();
        orphan.cloud_name = "gone".to_string();
        assert!(matches!(
            controller.terminate_worker(&orphan).await,
            Err(Error::NotFound(_))
        ));
    }
}
