//! Per-cluster cache of connected etcd v3 clients

use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{ClientConfig, EtcdClient, Result};

/// Owns one connected client per cluster name. Clients are created on first
/// use and dropped when the cluster is torn down.
#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<String, EtcdClient>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached client for a cluster, dialing it if absent.
    ///
    /// The config's endpoint set is expected to be stable for the lifetime of
    /// the cache entry; callers invalidate on membership change.
    pub async fn cluster_client(&self, cluster: &str, config: &ClientConfig) -> Result<EtcdClient> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(cluster) {
            return Ok(client.clone());
        }
        let client = EtcdClient::connect(config).await?;
        clients.insert(cluster.to_string(), client.clone());
        Ok(client)
    }

    /// One-off client bound to a single endpoint, never cached
    pub async fn endpoint_client(
        &self,
        config: &ClientConfig,
        endpoint: &str,
    ) -> Result<EtcdClient> {
        EtcdClient::connect(&config.for_endpoint(endpoint)).await
    }

    /// Drop the cached client for a cluster
    pub async fn invalidate(&self, cluster: &str) {
        self.clients.lock().await.remove(cluster);
    }

    /// Drop every cached client
    pub async fn shutdown(&self) {
        self.clients.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalidate_unknown_cluster_is_noop() {
        let pool = ClientPool::new();
        pool.invalidate("absent").await;
        pool.shutdown().await;
    }
}
