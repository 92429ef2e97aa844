//! Prometheus metric families published by the inspection engine
//!
//! All families live under the `kstone_inspection` prefix and are encoded by
//! the health server's `/metrics` endpoint.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels keyed by cluster only
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub cluster: String,
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())
    }
}

/// Labels for per-endpoint gauges
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct EndpointLabels {
    pub cluster: String,
    pub endpoint: String,
}

impl EncodeLabelSet for EndpointLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("endpoint", self.endpoint.as_str()).encode(encoder.encode_label())
    }
}

/// Labels for the alarm gauge
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct AlarmLabels {
    pub cluster: String,
    pub endpoint: String,
    pub alarm_kind: String,
}

impl EncodeLabelSet for AlarmLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("endpoint", self.endpoint.as_str()).encode(encoder.encode_label())?;
        ("alarmKind", self.alarm_kind.as_str()).encode(encoder.encode_label())
    }
}

/// Labels for the request counter
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RequestLabels {
    pub cluster: String,
    pub grpc_method: String,
    pub etcd_prefix: String,
    pub resource_name: String,
}

impl EncodeLabelSet for RequestLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("grpcMethod", self.grpc_method.as_str()).encode(encoder.encode_label())?;
        ("etcdPrefix", self.etcd_prefix.as_str()).encode(encoder.encode_label())?;
        ("resourceName", self.resource_name.as_str()).encode(encoder.encode_label())
    }
}

/// Labels for the key-total gauge; deliberately a separate set from
/// [`RequestLabels`] so the two families never share a sample
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KeyLabels {
    pub cluster: String,
    pub etcd_prefix: String,
    pub resource_name: String,
}

impl EncodeLabelSet for KeyLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("etcdPrefix", self.etcd_prefix.as_str()).encode(encoder.encode_label())?;
        ("resourceName", self.resource_name.as_str()).encode(encoder.encode_label())
    }
}

/// Labels for the per-feature failure counter
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FailureLabels {
    pub cluster: String,
    pub inspection_type: String,
}

impl EncodeLabelSet for FailureLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        ("cluster", self.cluster.as_str()).encode(encoder.encode_label())?;
        ("inspectionType", self.inspection_type.as_str()).encode(encoder.encode_label())
    }
}

/// The inspection metric families
pub struct Metrics {
    /// 1 when a member's `/health` returns healthy, 0 otherwise
    pub endpoint_healthy: Family<EndpointLabels, Gauge>,
    /// 1 while an alarm of the labeled kind is active on the endpoint
    pub endpoint_alarm: Family<AlarmLabels, Gauge>,
    /// max-min key-count difference across members
    pub node_diff: Family<ClusterLabels, Gauge>,
    /// max-min revision difference across members
    pub node_revision_diff: Family<ClusterLabels, Gauge>,
    /// max-min store-index difference across members
    pub node_index_diff: Family<ClusterLabels, Gauge>,
    /// max-min raft applied index difference across members
    pub node_raft_applied_index_diff: Family<ClusterLabels, Gauge>,
    /// max-min raft index difference across members
    pub node_raft_index_diff: Family<ClusterLabels, Gauge>,
    /// PUT/DELETE events observed on the watched prefix
    pub request_total: Family<RequestLabels, Counter>,
    /// live key count per prefix/resource
    pub key_total: Family<KeyLabels, Gauge>,
    /// backup files seen in the last day
    pub backup_files: Family<ClusterLabels, Gauge>,
    /// desired-minus-actual backup files in the last day, clamped at zero
    pub failed_backup_files: Family<ClusterLabels, Gauge>,
    /// probe failures per cluster and inspection type
    pub inspection_failures: Family<FailureLabels, Counter>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("kstone_inspection");

        let endpoint_healthy = Family::<EndpointLabels, Gauge>::default();
        registry.register(
            "etcd_endpoint_healthy",
            "The healthy of etcd member",
            endpoint_healthy.clone(),
        );

        let endpoint_alarm = Family::<AlarmLabels, Gauge>::default();
        registry.register(
            "etcd_endpoint_alarm",
            "The alarm of etcd member",
            endpoint_alarm.clone(),
        );

        let node_diff = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_node_diff_total",
            "The key difference between all members",
            node_diff.clone(),
        );

        let node_revision_diff = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_node_revision_diff_total",
            "The revision difference between all members",
            node_revision_diff.clone(),
        );

        let node_index_diff = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_node_index_diff_total",
            "The index difference between all members",
            node_index_diff.clone(),
        );

        let node_raft_applied_index_diff = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_node_raft_applied_index_diff_total",
            "The raft applied index difference between all members",
            node_raft_applied_index_diff.clone(),
        );

        let node_raft_index_diff = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_node_raft_index_diff_total",
            "The raft index difference between all members",
            node_raft_index_diff.clone(),
        );

        let request_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "etcd_request",
            "The total number of etcd requests",
            request_total.clone(),
        );

        let key_total = Family::<KeyLabels, Gauge>::default();
        registry.register(
            "etcd_key_total",
            "The total number of etcd keys",
            key_total.clone(),
        );

        let backup_files = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_backup_files",
            "The number of backup files in the last day",
            backup_files.clone(),
        );

        let failed_backup_files = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "etcd_failed_backup_files",
            "The number of failed backup files in the last day",
            failed_backup_files.clone(),
        );

        let inspection_failures = Family::<FailureLabels, Counter>::default();
        registry.register(
            "failed_num",
            "The total number of failed inspections",
            inspection_failures.clone(),
        );

        Self {
            endpoint_healthy,
            endpoint_alarm,
            node_diff,
            node_revision_diff,
            node_index_diff,
            node_raft_applied_index_diff,
            node_raft_index_diff,
            request_total,
            key_total,
            backup_files,
            failed_backup_files,
            inspection_failures,
            registry,
        }
    }

    /// Record one probe failure for a cluster/feature pair
    pub fn record_inspection_failure(&self, cluster: &str, inspection_type: &str) {
        self.inspection_failures
            .get_or_create(&FailureLabels {
                cluster: cluster.to_string(),
                inspection_type: inspection_type.to_string(),
            })
            .inc();
    }

    /// Encode all families to the Prometheus text format.
    ///
    /// Returns an empty string if encoding fails (should never happen with
    /// valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_encode_with_prefix() {
        let metrics = Metrics::new();
        metrics
            .endpoint_healthy
            .get_or_create(&EndpointLabels {
                cluster: "demo".into(),
                endpoint: "10.0.0.5".into(),
            })
            .set(1);
        metrics.record_inspection_failure("demo", "healthy");

        let encoded = metrics.encode();
        assert!(encoded.contains("kstone_inspection_etcd_endpoint_healthy"));
        assert!(encoded.contains("kstone_inspection_failed_num"));
        assert!(encoded.contains("cluster=\"demo\""));
    }

    #[test]
    fn request_and_key_families_never_share_label_sets() {
        let metrics = Metrics::new();
        metrics
            .request_total
            .get_or_create(&RequestLabels {
                cluster: "demo".into(),
                grpc_method: "PUT".into(),
                etcd_prefix: "registry".into(),
                resource_name: "pods".into(),
            })
            .inc();
        metrics
            .key_total
            .get_or_create(&KeyLabels {
                cluster: "demo".into(),
                etcd_prefix: "registry".into(),
                resource_name: "pods".into(),
            })
            .set(3);

        let encoded = metrics.encode();
        let key_line = encoded
            .lines()
            .find(|l| l.starts_with("kstone_inspection_etcd_key_total{"))
            .unwrap();
        assert!(!key_line.contains("grpcMethod"));
        let request_line = encoded
            .lines()
            .find(|l| l.starts_with("kstone_inspection_etcd_request_total{"))
            .unwrap();
        assert!(request_line.contains("grpcMethod=\"PUT\""));
    }
}
