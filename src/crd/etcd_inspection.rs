use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// EtcdInspection is the Schema for the etcdinspections API
///
/// One inspection resource exists per `<cluster, feature>` pair and is
/// owner-referenced to its cluster so it is garbage-collected with it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "etcd.tkestack.io",
    version = "v1alpha2",
    kind = "EtcdInspection",
    plural = "etcdinspections",
    shortname = "ei",
    namespaced,
    status = "EtcdInspectionStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.inspectionType"}"#,
    printcolumn = r#"{"name":"LastUpdated", "type":"string", "jsonPath":".status.lastUpdatedTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdInspectionSpec {
    /// Name of the EtcdCluster this probe targets
    pub cluster_name: String,

    /// Feature name that selects the provider executing the probe
    pub inspection_type: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inspection_provider: String,

    /// Seconds between probe iterations; 0 selects the default interval
    #[serde(default)]
    pub interval_in_second: u64,
}

/// Outcome of one probe iteration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct InspectionRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EtcdInspectionStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Bounded history of probe outcomes, newest last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<InspectionRecord>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_updated_time: String,
}

impl EtcdInspection {
    /// Name of the inspection resource for a cluster/feature pair
    pub fn task_name(cluster_name: &str, feature: &str) -> String {
        format!("{}-{}", cluster_name, feature)
    }
}
