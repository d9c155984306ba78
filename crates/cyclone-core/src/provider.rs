//! Cloud provider trait and configuration.
//!
//! A provider is one compute backend (a Docker daemon, a Kubernetes
//! namespace) capable of running workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::quota::{Quota, Resource};
use crate::worker::{Worker, WorkerInfo, WorkerInstance, WorkerOptions, WorkerRequest};
use crate::{Error, Result};

pub const KIND_DOCKER: &str = "docker";
pub const KIND_KUBERNETES: &str = "kubernetes";

/// Persisted description of a registered cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudConfig {
    pub name: String,
    /// Backend kind; `docker` and `kubernetes` are built in.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerSettings {
    /// `unix:///var/run/docker.sock` or `tcp://host:2376`.
    pub host: String,
    /// Directory holding `ca.pem`, `cert.pem` and `key.pem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub in_cluster: bool,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            bearer_token: None,
            namespace: default_namespace(),
            in_cluster: false,
        }
    }
}

impl CloudConfig {
    pub fn docker(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KIND_DOCKER.to_string(),
            insecure: false,
            docker: Some(DockerSettings {
                host: host.into(),
                cert_path: None,
            }),
            kubernetes: None,
        }
    }

    pub fn kubernetes(name: impl Into<String>, settings: KubernetesSettings) -> Self {
        Self {
            name: name.into(),
            kind: KIND_KUBERNETES.to_string(),
            insecure: false,
            docker: None,
            kubernetes: Some(settings),
        }
    }

    pub fn docker_settings(&self) -> Result<&DockerSettings> {
        self.docker
            .as_ref()
            .ok_or_else(|| Error::Config(format!("cloud {} has no docker settings", self.name)))
    }

    pub fn kubernetes_settings(&self) -> Result<&KubernetesSettings> {
        self.kubernetes.as_ref().ok_or_else(|| {
            Error::Config(format!("cloud {} has no kubernetes settings", self.name))
        })
    }

    /// Checks the name and the sub-object required by a built-in kind.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("cloud name must not be empty".to_string()));
        }
        match self.kind.as_str() {
            KIND_DOCKER => {
                if self.docker_settings()?.host.is_empty() {
                    return Err(Error::Config(format!("cloud {} has no docker host", self.name)));
                }
            }
            KIND_KUBERNETES => {
                let k8s = self.kubernetes_settings()?;
                if !k8s.in_cluster && k8s.host.is_empty() {
                    return Err(Error::Config(format!(
                        "cloud {} needs a host unless in_cluster is set",
                        self.name
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Trait for compute backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registered name of this cloud.
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Current limit and usage.
    async fn resource(&self) -> Result<Resource>;

    /// Whether `quota` fits the current headroom. A zero limit always fits.
    async fn can_provision(&self, quota: &Quota) -> Result<bool> {
        let resource = self.resource().await?;
        Ok(resource.limit.enough(&resource.used, quota))
    }

    /// Build an unstarted worker for `request`.
    fn new_worker(&self, request: &WorkerRequest, options: &WorkerOptions)
    -> Result<Box<dyn Worker>>;

    /// Admission check, then create and start the worker.
    ///
    /// Fails with [`Error::InsufficientResource`] before touching the backend
    /// when the quota does not fit.
    async fn provision(&self, request: &WorkerRequest, options: &WorkerOptions) -> Result<WorkerInfo> {
        if !self.can_provision(&request.quota).await? {
            return Err(Error::InsufficientResource);
        }
        let mut worker = self.new_worker(request, options)?;
        worker.start().await?;
        Ok(worker.info().clone())
    }

    /// Rehydrate a worker from its descriptor. Does not contact the backend.
    fn load_worker(&self, info: &WorkerInfo) -> Result<Box<dyn Worker>>;

    async fn terminate_worker(&self, info: &WorkerInfo) -> Result<()> {
        self.load_worker(info)?.terminate().await
    }

    /// Compute units carrying the worker label.
    async fn list_workers(&self) -> Result<Vec<WorkerInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_kind_settings() {
        let mut config = CloudConfig::docker("local", "unix:///var/run/docker.sock");
        assert!(config.validate().is_ok());

        config.docker = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_kubernetes_host() {
        let config = CloudConfig::kubernetes("k8s", KubernetesSettings::default());
        assert!(config.validate().is_err());

        let config = CloudConfig::kubernetes(
            "k8s",
            KubernetesSettings {
                in_cluster: true,
                namespace: "ci".to_string(),
                ..Default::default()
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_kind_passes_validation() {
        let mut config = CloudConfig::docker("x", "tcp://x:2376");
        config.kind = "nomad".to_string();
        config.docker = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_uses_type_field() {
        let config: CloudConfig = serde_json::from_str(
            r#"{"name":"k8s","type":"kubernetes","kubernetes":{"host":"https://k8s:6443"}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, KIND_KUBERNETES);
        assert_eq!(config.kubernetes.unwrap().namespace, "default");
    }
}
