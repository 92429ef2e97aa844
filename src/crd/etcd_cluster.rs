use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// EtcdCluster is the Schema for the etcdclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "etcd.tkestack.io",
    version = "v1alpha2",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "ec",
    namespaced,
    status = "EtcdClusterStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.clusterType"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Cluster name, the unique key within the namespace
    pub name: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Which cluster provider manages the lifecycle of this cluster
    pub cluster_type: EtcdClusterType,

    /// Desired member count (1, 3, 5 or 7)
    #[serde(default = "default_size")]
    pub size: u32,

    /// Disk type of each member (e.g. CLOUD_SSD)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub disk_type: String,

    /// Disk size of each member in GB
    #[serde(default)]
    pub disk_size: u32,

    /// etcd version to run
    pub version: String,

    /// etcd image repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,

    /// Extra etcd arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Environment variables for etcd members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Resource requests and limits for each member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Scheduling affinity, carried through to the cluster provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,

    /// Tolerations, carried through to the cluster provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<serde_json::Value>,

    /// TLS configuration
    #[serde(default)]
    pub auth_config: AuthConfig,
}

fn default_size() -> u32 {
    1
}

/// Environment variable for an etcd member
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Resource requests and limits
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

/// TLS settings for client connections to the managed cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// Whether clients must present TLS certificates
    #[serde(default)]
    pub enable_tls: bool,

    /// Subject alternative names for generated certificates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub san: Vec<String>,

    /// Secret holding the client certificate material
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret: String,
}

/// Discriminator selecting the cluster provider
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum EtcdClusterType {
    /// Cluster provisioned and owned by the operator
    #[serde(rename = "kstone-managed", alias = "kstone-etcd-operator")]
    KstoneManaged,
    /// Pre-existing cluster registered by address
    #[serde(rename = "imported")]
    Imported,
}

impl std::fmt::Display for EtcdClusterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EtcdClusterType::KstoneManaged => write!(f, "kstone-managed"),
            EtcdClusterType::Imported => write!(f, "imported"),
        }
    }
}

/// Observed state of an EtcdCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Ordered history of lifecycle actions; the tail condition per type is live
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    /// Current lifecycle phase
    #[serde(default)]
    pub phase: EtcdClusterPhase,

    /// Per-member runtime status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberStatus>,

    /// Last sync outcome per feature name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates_status: BTreeMap<String, String>,

    /// Address external collaborators use to reach the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum EtcdClusterPhase {
    #[default]
    Initing,
    Creating,
    Running,
    Updating,
    #[serde(alias = "Deleteing")]
    Deleting,
    Deleted,
    /// Endpoints could not be reached at all
    Unknown,
    /// At least one member failed its health check
    #[serde(alias = "UnHealthy")]
    Unhealthy,
}

impl std::fmt::Display for EtcdClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EtcdClusterPhase::Initing => write!(f, "Initing"),
            EtcdClusterPhase::Creating => write!(f, "Creating"),
            EtcdClusterPhase::Running => write!(f, "Running"),
            EtcdClusterPhase::Updating => write!(f, "Updating"),
            EtcdClusterPhase::Deleting => write!(f, "Deleting"),
            EtcdClusterPhase::Deleted => write!(f, "Deleted"),
            EtcdClusterPhase::Unknown => write!(f, "Unknown"),
            EtcdClusterPhase::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Lifecycle action a condition tracks
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterConditionType {
    Create,
    Import,
    Update,
    Delete,
}

/// Condition status, following Kubernetes conventions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One entry of the lifecycle condition history
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Lifecycle action this condition tracks
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,

    /// True once the action completed, False while in progress
    pub status: ConditionStatus,

    /// When the action was dispatched
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub start_time: String,

    /// When the action completed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub end_time: String,

    /// Brief reason for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Phase of a single member
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum MemberPhase {
    /// The member list knows the member but it has not started
    #[default]
    UnStarted,
    /// Health check passed
    Running,
    /// Health check returned unhealthy
    #[serde(alias = "UnHealthy")]
    Unhealthy,
    /// Endpoint could not be reached
    #[serde(alias = "UnKnown")]
    Unknown,
}

/// Raft role of a member
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum EtcdMemberRole {
    Leader,
    Follower,
    Learner,
    /// Member is listed but its endpoint could not be queried
    #[default]
    #[serde(alias = "UnKnown")]
    Unknown,
}

/// Runtime status of one etcd member
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub name: String,
    pub member_id: String,
    #[serde(default)]
    pub status: MemberPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Host part of the advertised client URL
    pub endpoint: String,
    pub port: String,
    pub client_url: String,
    /// Rewritten client URL reachable from the control plane; falls back to
    /// the raw client URL when no rewrite entry matches
    pub extension_client_url: String,
    #[serde(default)]
    pub role: EtcdMemberRole,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl EtcdCluster {
    /// Look up a recognized annotation, treating an empty value as absent
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(|v| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// The TLS secret reference from the `certName` annotation
    pub fn tls_secret_ref(&self) -> &str {
        self.annotation(crate::crd::annotations::CERT_NAME)
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_spellings_normalize_on_ingress() {
        let phase: EtcdClusterPhase = serde_json::from_str("\"UnHealthy\"").unwrap();
        assert_eq!(phase, EtcdClusterPhase::Unhealthy);
        assert_eq!(serde_json::to_string(&phase).unwrap(), "\"Unhealthy\"");

        let phase: EtcdClusterPhase = serde_json::from_str("\"Deleteing\"").unwrap();
        assert_eq!(phase, EtcdClusterPhase::Deleting);

        let role: EtcdMemberRole = serde_json::from_str("\"UnKnown\"").unwrap();
        assert_eq!(role, EtcdMemberRole::Unknown);

        let member: MemberPhase = serde_json::from_str("\"UnKnown\"").unwrap();
        assert_eq!(member, MemberPhase::Unknown);
    }

    #[test]
    fn cluster_type_accepts_legacy_operator_tag() {
        let t: EtcdClusterType = serde_json::from_str("\"kstone-etcd-operator\"").unwrap();
        assert_eq!(t, EtcdClusterType::KstoneManaged);
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"kstone-managed\"");
    }

    #[test]
    fn empty_annotation_values_read_as_absent() {
        let mut cluster = EtcdCluster::new(
            "demo",
            EtcdClusterSpec {
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
                auth_config: AuthConfig::default(),
            },
        );
        assert!(cluster.annotation("certName").is_none());

        cluster.metadata.annotations = Some(
            [("certName".to_string(), String::new())]
                .into_iter()
                .collect(),
        );
        assert!(cluster.annotation("certName").is_none());
        assert_eq!(cluster.tls_secret_ref(), "");
    }
}
