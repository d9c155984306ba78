//! Error types for Cyclone.

use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The admission check of a cloud failed. Recoverable: the fleet may free
    /// capacity later.
    #[error("insufficient resource")]
    InsufficientResource,

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    AllCloudsFailed(#[from] CloudProvisionError),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_insufficient_resource(&self) -> bool {
        matches!(self, Error::InsufficientResource)
    }

    /// True when provisioning failed only because every cloud lacked capacity.
    ///
    /// A bare `InsufficientResource` counts as the single-cloud case.
    pub fn is_all_clouds_busy(&self) -> bool {
        match self {
            Error::InsufficientResource => true,
            Error::AllCloudsFailed(e) => e.is_all_busy(),
            _ => false,
        }
    }
}

/// Per-cloud failures collected while trying every registered cloud in order.
#[derive(Debug, Default)]
pub struct CloudProvisionError {
    errors: IndexMap<String, Error>,
}

impl CloudProvisionError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cloud: impl Into<String>, err: Error) {
        self.errors.insert(cloud.into(), err);
    }

    pub fn get(&self, cloud: &str) -> Option<&Error> {
        self.errors.get(cloud)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_all_busy(&self) -> bool {
        !self.errors.is_empty() && self.errors.values().all(Error::is_insufficient_resource)
    }
}

impl fmt::Display for CloudProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no cloud could provision the worker")?;
        for (i, (cloud, err)) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{cloud}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloudProvisionError {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_busy_requires_only_resource_errors() {
        let mut agg = CloudProvisionError::new();
        agg.add("docker", Error::InsufficientResource);
        agg.add("k8s", Error::InsufficientResource);
        assert!(Error::from(agg).is_all_clouds_busy());

        let mut agg = CloudProvisionError::new();
        agg.add("docker", Error::InsufficientResource);
        agg.add("k8s", Error::Provision("connection refused".to_string()));
        assert!(!Error::from(agg).is_all_clouds_busy());
    }

    #[test]
    fn test_empty_aggregate_is_not_busy() {
        assert!(!CloudProvisionError::new().is_all_busy());
    }

    #[test]
    fn test_other_errors_are_not_busy() {
        assert!(!Error::Config("unknown kind".to_string()).is_all_clouds_busy());
        assert!(Error::InsufficientResource.is_all_clouds_busy());
    }

    #[test]
    fn test_aggregate_message_names_each_cloud() {
        let mut agg = CloudProvisionError::new();
        agg.add("a", Error::InsufficientResource);
        agg.add("b", Error::Provision("image pull failed".to_string()));
        assert_eq!(
            agg.to_string(),
            "no cloud could provision the worker: a: insufficient resource; b: provisioning failed: image pull failed"
        );
    }
}
