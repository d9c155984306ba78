//! Provider constructors keyed by cloud kind.

use cyclone_core::provider::{KIND_DOCKER, KIND_KUBERNETES};
use cyclone_core::{CloudConfig, Error, Provider, Result, WorkerOptions};
use std::collections::HashMap;
use std::sync::Arc;

use crate::docker::DockerCloud;
use crate::kubernetes::KubernetesCloud;

/// Builds a provider from its persisted configuration.
pub type ProviderFactory =
    Box<dyn Fn(&CloudConfig, &WorkerOptions) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Registry of provider constructors.
///
/// New backends register a factory under their kind; the controller never
/// names a concrete backend.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    /// A registry with no kinds at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in `docker` and `kubernetes` kinds.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(KIND_DOCKER, |config, options| {
            let cloud = DockerCloud::new(config)?.with_debug(options.debug);
            Ok(Arc::new(cloud) as Arc<dyn Provider>)
        });
        registry.register(KIND_KUBERNETES, |config, _| {
            Ok(Arc::new(KubernetesCloud::new(config)?) as Arc<dyn Provider>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&CloudConfig, &WorkerOptions) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Validate `config` and run the factory for its kind.
    pub fn build(&self, config: &CloudConfig, options: &WorkerOptions) -> Result<Arc<dyn Provider>> {
        config.validate()?;
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            Error::Config(format!(
                "unknown cloud kind {:?} for cloud {}",
                config.kind, config.name
            ))
        })?;
        factory(config, options)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
