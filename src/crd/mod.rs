mod etcd_cluster;
mod etcd_inspection;

pub use etcd_cluster::*;
pub use etcd_inspection::*;

/// Annotation keys recognized on EtcdCluster resources
pub mod annotations {
    /// Comma-separated `name=bool` feature-gate expression
    pub const FEATURE_GATES: &str = "featureGates";
    /// TLS secret reference, `name` or `namespace/name`
    pub const CERT_NAME: &str = "certName";
    /// Comma-separated `host:port->host:port` client URL rewrites
    pub const EXT_CLIENT_URL: &str = "extClientURL";
    /// Fallback endpoint for imported clusters
    pub const IMPORTED_ADDR: &str = "importedAddr";
    /// Backup configuration JSON blob
    pub const BACKUP: &str = "backup";
    /// Consistency probe parameters, `{path, interval}`
    pub const CONSISTENCY: &str = "cruiseConsistency";
    /// Request probe parameters, `{path, interval, prefix}`
    pub const REQUEST: &str = "request";
}
