//! Provider for clusters imported by address
//!
//! Imported clusters have no managed data plane, so every lifecycle hook is
//! a no-op and `equal` always holds; the provider's work is the status probe.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::crd::{EtcdCluster, EtcdClusterPhase, EtcdClusterStatus, annotations};
use crate::etcd::{ClientConfig, ClientPool, HttpProbe};

use super::{ClusterProvider, Result, member_health, runtime_members, storage_member_endpoints};

pub struct ImportedClusterProvider {
    pool: Arc<ClientPool>,
}

impl ImportedClusterProvider {
    pub fn new(pool: Arc<ClientPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClusterProvider for ImportedClusterProvider {
    async fn equal(&self, _cluster: &EtcdCluster) -> Result<bool> {
        Ok(true)
    }

    async fn status(
        &self,
        config: &ClientConfig,
        cluster: &EtcdCluster,
    ) -> Result<EtcdClusterStatus> {
        let mut status = cluster.status.clone().unwrap_or_default();

        let mut endpoints = storage_member_endpoints(cluster);
        if endpoints.is_empty() {
            match cluster.annotation(annotations::IMPORTED_ADDR) {
                Some(addr) => {
                    endpoints.push(addr.to_string());
                    status.service_name = addr.to_string();
                }
                None => {
                    status.phase = EtcdClusterPhase::Unknown;
                    return Ok(status);
                }
            }
        }

        let config = ClientConfig {
            endpoints,
            ..config.clone()
        };
        let extension_urls = cluster
            .annotation(annotations::EXT_CLIENT_URL)
            .unwrap_or("");

        let members = match runtime_members(
            &self.pool,
            &cluster.name_any(),
            &config,
            extension_urls,
        )
        .await
        {
            Ok(members) if !members.is_empty() => members,
            Ok(_) => {
                status.phase = EtcdClusterPhase::Unknown;
                return Ok(status);
            }
            Err(e) => {
                tracing::warn!(cluster = %cluster.name_any(), "failed to fetch members: {}", e);
                status.phase = EtcdClusterPhase::Unknown;
                return Ok(status);
            }
        };

        let probe = HttpProbe::new(config.tls.as_ref());
        let (members, phase) = member_health(probe, members).await;
        status.members = members;
        status.phase = phase;
        Ok(status)
    }
}
