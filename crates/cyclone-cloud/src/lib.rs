//! Cloud provider backends for Cyclone.
//!
//! Provides provider implementations for running workers:
//! - Kubernetes (production)
//! - Docker (development and small deployments)
//!
//! The [`CloudController`] holds the registered providers and fails over
//! between them when provisioning.

pub mod controller;
pub mod docker;
pub mod env;
pub mod kubernetes;
pub mod registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::CloudController;
pub use docker::DockerCloud;
pub use kubernetes::KubernetesCloud;
pub use registry::ProviderRegistry;
