//! System configuration parsing.
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:7099"
//! }
//! worker {
//!     server "http://cyclone-server:7099"
//!     image "cargo.caicloud.io/caicloud/cyclone-worker"
//!     registry location="cargo.caicloud.io" username="ci" password="secret"
//!     timeout "2h"
//!     quota {
//!         limits.cpu "1"
//!         limits.memory "1Gi"
//!     }
//! }
//! manager {
//!     poll-interval "1s"
//!     max-retry 60
//!     retry-interval "1m"
//! }
//! cloud "local" type="docker" {
//!     host "unix:///var/run/docker.sock"
//! }
//! notification {
//!     url "http://hooks.internal/cyclone"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use cyclone_core::provider::{KIND_DOCKER, KIND_KUBERNETES};
use cyclone_core::{
    CloudConfig, DockerSettings, KubernetesSettings, Quantity, WorkerEnv, WorkerOptions,
};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:7099";

/// System-wide configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemConfig {
    pub server: ServerConfig,
    pub worker: WorkerOptions,
    pub manager: ManagerConfig,
    /// Clouds registered at startup, in priority order.
    pub clouds: Vec<CloudConfig>,
    pub notification: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub listen: String,
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            database_url: None,
        }
    }
}

/// Event manager tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub poll_interval: Duration,
    pub max_retry: u32,
    pub retry_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_retry: 60,
            retry_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationConfig {
    pub url: Option<String>,
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();
    let mut cloud_names = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => parse_server(node, &mut config.server)?,
            "worker" => parse_worker(node, &mut config.worker)?,
            "manager" => parse_manager(node, &mut config.manager)?,
            "notification" => {
                for child in child_nodes(node) {
                    if child.name().value() == "url" {
                        config.notification.url = Some(string_arg(child, "notification.url")?);
                    }
                }
            }
            "cloud" => {
                let cloud = parse_cloud(node)?;
                if !cloud_names.insert(cloud.name.clone()) {
                    return Err(ConfigError::Duplicate(format!("cloud {}", cloud.name)));
                }
                config.clouds.push(cloud);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_server(node: &KdlNode, server: &mut ServerConfig) -> ConfigResult<()> {
    for child in child_nodes(node) {
        match child.name().value() {
            "listen" => server.listen = string_arg(child, "server.listen")?,
            "database-url" => server.database_url = Some(string_arg(child, "server.database-url")?),
            _ => {}
        }
    }
    Ok(())
}

fn parse_worker(node: &KdlNode, options: &mut WorkerOptions) -> ConfigResult<()> {
    let env: &mut WorkerEnv = &mut options.env;
    for child in child_nodes(node) {
        let field = child.name().value();
        match field {
            "server" => env.server = string_arg(child, "worker.server")?,
            "console-web" => env.console_web = string_arg(child, "worker.console-web")?,
            "callback-url" => env.callback_url = string_arg(child, "worker.callback-url")?,
            "gitlab-url" => env.gitlab_url = string_arg(child, "worker.gitlab-url")?,
            "log-server" => env.log_server = string_arg(child, "worker.log-server")?,
            "image" => env.worker_image = string_arg(child, "worker.image")?,
            "registry" => {
                if let Some(location) = string_prop(child, "location") {
                    env.registry_location = location;
                }
                if let Some(username) = string_prop(child, "username") {
                    env.registry_username = username;
                }
                if let Some(password) = string_prop(child, "password") {
                    env.registry_password = password;
                }
            }
            "timeout" => options.timeout = duration_arg(child, "worker.timeout")?,
            "ready-poll-interval" => {
                options.ready_poll_interval = duration_arg(child, "worker.ready-poll-interval")?
            }
            "ready-timeout" => options.ready_timeout = duration_arg(child, "worker.ready-timeout")?,
            "debug" => options.debug = bool_arg(child, "worker.debug")?,
            "quota" => {
                for entry in child_nodes(child) {
                    let resource = entry.name().value();
                    let field = format!("worker.quota.{}", resource);
                    let quantity: Quantity = string_arg(entry, &field)?
                        .parse()
                        .map_err(|e| ConfigError::invalid(&field, e))?;
                    options.default_quota.insert(resource, quantity);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_manager(node: &KdlNode, manager: &mut ManagerConfig) -> ConfigResult<()> {
    for child in child_nodes(node) {
        match child.name().value() {
            "poll-interval" => manager.poll_interval = duration_arg(child, "manager.poll-interval")?,
            "retry-interval" => {
                manager.retry_interval = duration_arg(child, "manager.retry-interval")?
            }
            "max-retry" => {
                let value = integer_arg(child, "manager.max-retry")?;
                manager.max_retry = u32::try_from(value)
                    .map_err(|_| ConfigError::invalid("manager.max-retry", "out of range"))?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_cloud(node: &KdlNode) -> ConfigResult<CloudConfig> {
    let name = first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("cloud name".to_string()))?;
    let kind = string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("cloud {} type", name)))?;

    let mut config = CloudConfig {
        name,
        kind,
        insecure: false,
        docker: None,
        kubernetes: None,
    };

    match config.kind.as_str() {
        KIND_DOCKER => {
            let mut docker = DockerSettings::default();
            for child in child_nodes(node) {
                match child.name().value() {
                    "host" => docker.host = string_arg(child, "cloud.host")?,
                    "cert-path" => docker.cert_path = Some(string_arg(child, "cloud.cert-path")?),
                    "insecure" => config.insecure = bool_arg(child, "cloud.insecure")?,
                    _ => {}
                }
            }
            config.docker = Some(docker);
        }
        KIND_KUBERNETES => {
            let mut kubernetes = KubernetesSettings::default();
            for child in child_nodes(node) {
                match child.name().value() {
                    "host" => kubernetes.host = string_arg(child, "cloud.host")?,
                    "bearer-token" => {
                        kubernetes.bearer_token = Some(string_arg(child, "cloud.bearer-token")?)
                    }
                    "namespace" => kubernetes.namespace = string_arg(child, "cloud.namespace")?,
                    "in-cluster" => kubernetes.in_cluster = bool_arg(child, "cloud.in-cluster")?,
                    "insecure" => config.insecure = bool_arg(child, "cloud.insecure")?,
                    _ => {}
                }
            }
            config.kubernetes = Some(kubernetes);
        }
        other => {
            return Err(ConfigError::invalid(
                format!("cloud {} type", config.name),
                format!("unknown cloud kind {:?}", other),
            ));
        }
    }

    config
        .validate()
        .map_err(|e| ConfigError::invalid(format!("cloud {}", config.name), e))?;
    Ok(config)
}

/// Parse `500ms`, `7s`, `2m`, `2h` or a bare number of seconds.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {:?}", text))?;

    let seconds = |per_unit: u64| {
        value
            .checked_mul(per_unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {:?} is too large", text))
    };
    match unit {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, text)),
    }
}

// Helper functions for extracting values from KDL nodes

fn child_nodes(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|doc| doc.nodes()).unwrap_or(&[])
}

fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

fn first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn bool_arg(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    match first_arg(node) {
        Some(value) => value
            .as_bool()
            .ok_or_else(|| ConfigError::invalid(field, "expected a boolean")),
        None => Ok(true),
    }
}

fn integer_arg(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    first_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?
        .as_integer()
        .ok_or_else(|| ConfigError::invalid(field, "expected an integer"))
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let value = first_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    if let Some(seconds) = value.as_integer() {
        let seconds =
            u64::try_from(seconds).map_err(|_| ConfigError::invalid(field, "negative duration"))?;
        return Ok(Duration::from_secs(seconds));
    }
    let text = value
        .as_string()
        .ok_or_else(|| ConfigError::invalid(field, "expected a duration"))?;
    parse_duration(text).map_err(|e| ConfigError::invalid(field, e))
}

fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
