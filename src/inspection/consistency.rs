//! Cross-member consistency probe
//!
//! Fans out metadata reads over all members, sorts each series and publishes
//! the max-min spread. A uniform shift across members therefore leaves every
//! diff gauge unchanged. Members contribute only the series their storage
//! version exposes: v3 members revision and raft indices, v2 members the
//! store index.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use kube::ResourceExt;
use serde::Deserialize;

use crate::crd::{EtcdInspection, MemberStatus};
use crate::etcd::{ClientConfig, ClientPool, HttpProbe};
use crate::metrics::ClusterLabels;

use super::{DEFAULT_INSPECTION_PATH, InspectionError, Result, Server};

/// Concurrent member probes per inspection
const PROBE_CONCURRENCY: usize = 8;

/// The `cruiseConsistency` annotation payload
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ConsistencyInfo {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub interval: u64,
}

/// One member's contribution to the consistency series
#[derive(Debug, Clone, Copy, Default)]
struct MemberMetadata {
    key_total: u64,
    revision: Option<u64>,
    index: Option<u64>,
    raft_applied_index: Option<u64>,
    raft_index: Option<u64>,
}

async fn member_metadata(
    pool: &ClientPool,
    config: &ClientConfig,
    member: &MemberStatus,
    prefix: &str,
) -> Result<MemberMetadata> {
    // v2 members expose their store index over HTTP instead of raft metadata
    if member.version.starts_with('2') {
        let probe = HttpProbe::new(config.tls.as_ref())?;
        let (key_total, index) = probe
            .v2_key_count(&member.extension_client_url, prefix)
            .await?;
        return Ok(MemberMetadata {
            key_total,
            index: Some(index),
            ..Default::default()
        });
    }

    let client = pool
        .endpoint_client(config, &member.extension_client_url)
        .await?;
    let key_total = client.key_count(prefix).await?;
    let metadata = client.index_metadata().await?;
    Ok(MemberMetadata {
        key_total,
        revision: Some(metadata.revision),
        index: None,
        raft_applied_index: Some(metadata.raft_applied_index),
        raft_index: Some(metadata.raft_index),
    })
}

/// Spread of a series: max minus min after sorting
fn spread(mut values: Vec<u64>) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[values.len() - 1] - values[0])
}

impl Server {
    /// Collect per-member metadata, compute the spreads and publish the diff
    /// gauges
    pub async fn collect_cluster_consistency(&self, task: &EtcdInspection) -> Result<()> {
        let namespace = task.namespace().unwrap_or_default();
        let (cluster, config) = self
            .cluster_info(&namespace, &task.spec.cluster_name)
            .await?;

        let prefix = cluster
            .annotation(crate::crd::annotations::CONSISTENCY)
            .and_then(|raw| serde_json::from_str::<ConsistencyInfo>(raw).ok())
            .map(|info| info.path)
            .unwrap_or_else(|| DEFAULT_INSPECTION_PATH.to_string());

        let members = cluster
            .status
            .as_ref()
            .map(|s| s.members.clone())
            .unwrap_or_default();
        if members.is_empty() {
            return Err(InspectionError::Config(format!(
                "cluster {} has no members to probe",
                cluster.name_any()
            )));
        }

        let mut probes = FuturesUnordered::new();
        let mut pending = members.iter();
        let mut collected: Vec<MemberMetadata> = Vec::with_capacity(members.len());

        loop {
            while probes.len() < PROBE_CONCURRENCY {
                let Some(member) = pending.next() else { break };
                probes.push(member_metadata(self.pool(), &config, member, &prefix));
            }
            match probes.next().await {
                Some(result) => collected.push(result?),
                None => break,
            }
        }

        let labels = ClusterLabels {
            cluster: cluster.name_any(),
        };
        let metrics = self.metrics();

        if let Some(diff) = spread(collected.iter().map(|m| m.key_total).collect()) {
            metrics.node_diff.get_or_create(&labels).set(diff as i64);
        }
        if let Some(diff) = spread(collected.iter().filter_map(|m| m.revision).collect()) {
            metrics
                .node_revision_diff
                .get_or_create(&labels)
                .set(diff as i64);
        }
        if let Some(diff) = spread(collected.iter().filter_map(|m| m.index).collect()) {
            metrics
                .node_index_diff
                .get_or_create(&labels)
                .set(diff as i64);
        }
        if let Some(diff) = spread(collected.iter().filter_map(|m| m.raft_applied_index).collect())
        {
            metrics
                .node_raft_applied_index_diff
                .get_or_create(&labels)
                .set(diff as i64);
        }
        if let Some(diff) = spread(collected.iter().filter_map(|m| m.raft_index).collect()) {
            metrics
                .node_raft_index_diff
                .get_or_create(&labels)
                .set(diff as i64);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spread_is_max_minus_min() {
        assert_eq!(spread(vec![100, 100, 103]), Some(3));
        assert_eq!(spread(vec![200, 200, 200]), Some(0));
        assert_eq!(spread(vec![]), None);
        assert_eq!(spread(vec![7]), Some(0));
    }

    #[test]
    fn spread_is_invariant_under_uniform_shift() {
        let base = vec![10u64, 25, 40];
        let shifted: Vec<u64> = base.iter().map(|v| v + 1000).collect();
        assert_eq!(spread(base), spread(shifted));
    }

    #[test]
    fn v2_members_contribute_only_key_and_index_series() {
        let collected = [
            MemberMetadata {
                key_total: 100,
                revision: Some(50),
                raft_applied_index: Some(60),
                raft_index: Some(61),
                index: None,
            },
            MemberMetadata {
                key_total: 103,
                index: Some(40),
                ..Default::default()
            },
        ];
        let revisions: Vec<u64> = collected.iter().filter_map(|m| m.revision).collect();
        assert_eq!(revisions, vec![50]);
        let indices: Vec<u64> = collected.iter().filter_map(|m| m.index).collect();
        assert_eq!(indices, vec![40]);
        assert_eq!(
            spread(collected.iter().map(|m| m.key_total).collect()),
            Some(3)
        );
    }

    #[test]
    fn consistency_info_parses() {
        let info: ConsistencyInfo =
            serde_json::from_str(r#"{"path":"/registry","interval":60}"#).unwrap();
        assert_eq!(info.path, "/registry");
        assert_eq!(info.interval, 60);
    }
}
