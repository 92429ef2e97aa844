//! Alarm enumeration probe

use kube::ResourceExt;

use crate::cluster::storage_member_endpoints;
use crate::crd::EtcdInspection;
use crate::etcd::ClientConfig;
use crate::metrics::AlarmLabels;

use super::{InspectionError, Result, Server};

/// Alarm kinds the operator understands
pub const ALARM_KINDS: [&str; 2] = ["NOSPACE", "CORRUPT"];

impl Server {
    /// Enumerate active alarms and publish the `etcd_endpoint_alarm` gauge;
    /// an empty alarm list resets every known kind on every member endpoint
    pub async fn collect_alarm_list(&self, task: &EtcdInspection) -> Result<()> {
        let namespace = task.namespace().unwrap_or_default();
        let (cluster, config) = self
            .cluster_info(&namespace, &task.spec.cluster_name)
            .await?;
        let cluster_name = cluster.name_any();

        let status = cluster.status.clone().unwrap_or_default();
        let endpoints = if !status.service_name.is_empty() {
            vec![status.service_name.clone()]
        } else {
            storage_member_endpoints(&cluster)
        };
        if endpoints.is_empty() {
            return Err(InspectionError::Config(format!(
                "cluster {} has no endpoints to query alarms on",
                cluster_name
            )));
        }

        let config = ClientConfig {
            endpoints,
            ..config
        };
        let client = self.pool().cluster_client(&cluster_name, &config).await?;
        let alarms = client.alarm_list().await?;

        for member in &status.members {
            if alarms.is_empty() {
                for kind in ALARM_KINDS {
                    self.metrics()
                        .endpoint_alarm
                        .get_or_create(&AlarmLabels {
                            cluster: cluster_name.clone(),
                            endpoint: member.endpoint.clone(),
                            alarm_kind: kind.to_string(),
                        })
                        .set(0);
                }
                continue;
            }
            for alarm in &alarms {
                if member.member_id == alarm.member_id.to_string() {
                    self.metrics()
                        .endpoint_alarm
                        .get_or_create(&AlarmLabels {
                            cluster: cluster_name.clone(),
                            endpoint: member.endpoint.clone(),
                            alarm_kind: alarm.kind.clone(),
                        })
                        .set(1);
                }
            }
        }
        Ok(())
    }
}
