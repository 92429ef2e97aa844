//! Pluggable lifecycle providers, keyed by cluster type
//!
//! Providers are registered once at process start by the composition root;
//! the reconciler resolves them per cluster and drives the lifecycle hooks.

mod helper;
mod imported;

pub use helper::{
    member_health, parse_extension_url_map, rewrite_client_url, runtime_members, split_host_port,
    storage_member_endpoints,
};
pub use imported::ImportedClusterProvider;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::crd::{EtcdCluster, EtcdClusterStatus, EtcdClusterType};
use crate::etcd::{ClientConfig, EtcdError};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("no cluster provider registered for type {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Etcd(#[from] EtcdError),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// Lifecycle hooks and status probe for one cluster type.
///
/// The Before/After hooks default to no-ops; side effects belong in the
/// Create/Update/Delete hooks.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    async fn before_create(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn create(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn after_create(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }

    async fn before_update(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn update(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn after_update(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }

    async fn before_delete(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }
    async fn after_delete(&self, _cluster: &EtcdCluster) -> Result<()> {
        Ok(())
    }

    /// True when the observed cluster matches the desired spec
    async fn equal(&self, cluster: &EtcdCluster) -> Result<bool>;

    /// Probe the live cluster and compute its observed status
    async fn status(
        &self,
        config: &ClientConfig,
        cluster: &EtcdCluster,
    ) -> Result<EtcdClusterStatus>;
}

/// Explicit provider registry handed to the controllers at construction
#[derive(Default)]
pub struct ClusterProviderRegistry {
    providers: HashMap<EtcdClusterType, Arc<dyn ClusterProvider>>,
}

impl ClusterProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; first registration wins
    pub fn register(&mut self, cluster_type: EtcdClusterType, provider: Arc<dyn ClusterProvider>) {
        if self.providers.contains_key(&cluster_type) {
            tracing::warn!(%cluster_type, "cluster provider registered twice, keeping the first");
            return;
        }
        tracing::debug!(%cluster_type, "registered cluster provider");
        self.providers.insert(cluster_type, provider);
    }

    pub fn get(&self, cluster_type: EtcdClusterType) -> Result<Arc<dyn ClusterProvider>> {
        self.providers
            .get(&cluster_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(cluster_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProvider;

    #[async_trait]
    impl ClusterProvider for NoopProvider {
        async fn equal(&self, _cluster: &EtcdCluster) -> Result<bool> {
            Ok(true)
        }
        async fn status(
            &self,
            _config: &ClientConfig,
            cluster: &EtcdCluster,
        ) -> Result<EtcdClusterStatus> {
            Ok(cluster.status.clone().unwrap_or_default())
        }
    }

    struct OtherProvider;

    #[async_trait]
    impl ClusterProvider for OtherProvider {
        async fn equal(&self, _cluster: &EtcdCluster) -> Result<bool> {
            Ok(false)
        }
        async fn status(
            &self,
            _config: &ClientConfig,
            _cluster: &EtcdCluster,
        ) -> Result<EtcdClusterStatus> {
            Ok(EtcdClusterStatus::default())
        }
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = ClusterProviderRegistry::new();
        assert!(registry.get(EtcdClusterType::Imported).is_err());
    }

    #[tokio::test]
    async fn first_registration_wins() {
        let mut registry = ClusterProviderRegistry::new();
        registry.register(EtcdClusterType::Imported, Arc::new(NoopProvider));
        registry.register(EtcdClusterType::Imported, Arc::new(OtherProvider));

        let provider = registry.get(EtcdClusterType::Imported).unwrap();
        let cluster = EtcdCluster::new(
            "demo",
            crate::crd::EtcdClusterSpec {
                name: "demo".into(),
                description: String::new(),
                cluster_type: EtcdClusterType::Imported,
                size: 1,
                disk_type: String::new(),
                disk_size: 0,
                version: "3.5.9".into(),
                repository: String::new(),
                args: vec![],
                env: vec![],
                resources: None,
                affinity: None,
                tolerations: None,
                auth_config: Default::default(),
            },
        );
        assert!(provider.equal(&cluster).await.unwrap());
    }
}
