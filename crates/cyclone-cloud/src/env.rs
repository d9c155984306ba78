//! Environment handed to every provisioned worker.

use cyclone_core::quota::{LIMITS_CPU, LIMITS_MEMORY, REQUESTS_CPU, REQUESTS_MEMORY};
use cyclone_core::{EventId, Quota, WorkerEnv};

pub const EVENT_ID: &str = "WORKER_EVENTID";
pub const CYCLONE_SERVER: &str = "CYCLONE_SERVER";
pub const CONSOLE_WEB_ENDPOINT: &str = "CONSOLE_WEB_ENDPOINT";
pub const CALLBACK_URL: &str = "CALLBACK_URL";
pub const REGISTRY_LOCATION: &str = "REGISTRY_LOCATION";
pub const REGISTRY_USERNAME: &str = "REGISTRY_USERNAME";
pub const REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";
pub const WORKER_IMAGE: &str = "WORKER_IMAGE";
pub const GITLAB_URL: &str = "GITLAB_URL";
pub const LOG_SERVER: &str = "LOG_SERVER";
pub const LIMIT_CPU: &str = "LIMIT_CPU";
pub const LIMIT_MEMORY: &str = "LIMIT_MEMORY";
pub const REQUEST_CPU: &str = "REQUEST_CPU";
pub const REQUEST_MEMORY: &str = "REQUEST_MEMORY";

/// Working directory of the worker container; the source is cloned here.
pub const CLONE_DIR: &str = "/root/code";

/// Completion callback for an event, derived from the server address unless
/// configured explicitly.
pub fn callback_url(env: &WorkerEnv, event_id: &EventId) -> String {
    if env.callback_url.is_empty() {
        format!(
            "{}/api/v1/events/{}/status",
            env.server.trim_end_matches('/'),
            event_id
        )
    } else {
        env.callback_url.clone()
    }
}

/// Image reference with an explicit tag.
pub fn image_reference(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Variables for a worker, in a stable order.
///
/// `quota` is the effective quota with defaults applied. Request entries are
/// only emitted when `with_requests` is set; Docker has no request notion.
pub fn worker_env(
    event_id: &EventId,
    env: &WorkerEnv,
    quota: &Quota,
    with_requests: bool,
) -> Vec<(&'static str, String)> {
    let mut vars = vec![
        (EVENT_ID, event_id.to_string()),
        (CYCLONE_SERVER, env.server.clone()),
        (CONSOLE_WEB_ENDPOINT, env.console_web.clone()),
        (CALLBACK_URL, callback_url(env, event_id)),
        (REGISTRY_LOCATION, env.registry_location.clone()),
        (REGISTRY_USERNAME, env.registry_username.clone()),
        (REGISTRY_PASSWORD, env.registry_password.clone()),
        (WORKER_IMAGE, image_reference(&env.worker_image)),
        (GITLAB_URL, env.gitlab_url.clone()),
        (LOG_SERVER, env.log_server.clone()),
        (LIMIT_CPU, quota.get_or_zero(LIMITS_CPU).to_string()),
        (LIMIT_MEMORY, quota.get_or_zero(LIMITS_MEMORY).to_string()),
    ];
    if with_requests {
        vars.push((REQUEST_CPU, quota.get_or_zero(REQUESTS_CPU).to_string()));
        vars.push((REQUEST_MEMORY, quota.get_or_zero(REQUESTS_MEMORY).to_string()));
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use cyclone_core::quota::default_quota;

    fn lookup<'a>(vars: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_limits_render_native_units() {
        let id = EventId::new();
        let quota = default_quota().with(LIMITS_MEMORY, "512Mi".parse().unwrap());
        let vars = worker_env(&id, &WorkerEnv::default(), &quota, false);

        assert_eq!(lookup(&vars, LIMIT_CPU), Some("500m"));
        assert_eq!(lookup(&vars, LIMIT_MEMORY), Some("512Mi"));
        assert_eq!(lookup(&vars, EVENT_ID), Some(id.to_string().as_str()));
        assert!(lookup(&vars, REQUEST_CPU).is_none());
    }

    #[test]
    fn test_requests_are_optional() {
        let quota = default_quota().with(REQUESTS_CPU, "250m".parse().unwrap());
        let vars = worker_env(&EventId::new(), &WorkerEnv::default(), &quota, true);
        assert_eq!(lookup(&vars, REQUEST_CPU), Some("250m"));
        assert_eq!(lookup(&vars, REQUEST_MEMORY), Some("0"));
    }

    #[test]
    fn test_callback_url_derived_from_server() {
        let id = EventId::new();
        let mut env = WorkerEnv {
            server: "http://cyclone:7099/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            callback_url(&env, &id),
            format!("http://cyclone:7099/api/v1/events/{id}/status")
        );

        env.callback_url = "http://hooks/done".to_string();
        assert_eq!(callback_url(&env, &id), "http://hooks/done");
    }

    #[test]
    fn test_image_reference_adds_latest() {
        assert_eq!(
            image_reference("cargo.caicloud.io/caicloud/cyclone-worker"),
            "cargo.caicloud.io/caicloud/cyclone-worker:latest"
        );
        assert_eq!(image_reference("registry:5000/worker:v1"), "registry:5000/worker:v1");
        assert_eq!(image_reference("registry:5000/worker"), "registry:5000/worker:latest");
        assert_eq!(image_reference("alpine@sha256:abc"), "alpine@sha256:abc");
    }
}
