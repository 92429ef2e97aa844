//! Per-member health probe

use kube::ResourceExt;

use crate::crd::EtcdInspection;
use crate::etcd::HttpProbe;
use crate::metrics::EndpointLabels;

use super::{Result, Server};

impl Server {
    /// Probe every member's `/health` endpoint and publish the
    /// `etcd_endpoint_healthy` gauge
    pub async fn collect_member_healthy(&self, task: &EtcdInspection) -> Result<()> {
        let namespace = task.namespace().unwrap_or_default();
        let (cluster, config) = self
            .cluster_info(&namespace, &task.spec.cluster_name)
            .await?;
        let probe = HttpProbe::new(config.tls.as_ref())?;

        let members = cluster
            .status
            .as_ref()
            .map(|s| s.members.clone())
            .unwrap_or_default();

        for member in &members {
            let healthy = probe.health_check(&member.extension_client_url).await;
            self.metrics()
                .endpoint_healthy
                .get_or_create(&EndpointLabels {
                    cluster: cluster.name_any(),
                    endpoint: member.endpoint.clone(),
                })
                .set(i64::from(healthy));
        }
        Ok(())
    }
}
