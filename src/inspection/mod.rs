//! The inspection engine: executes per-cluster probe tasks and publishes
//! their results as Prometheus metrics
//!
//! Feature providers materialize one `EtcdInspection` resource per
//! `<cluster, feature>` pair; the inspection reconciler routes each record
//! back here by inspection type. Transient per-cluster state (watch streams,
//! event channels) lives behind a single mutex and is torn down when the
//! feature gate is disabled or the cluster deleted.

mod alarm;
mod backupcheck;
mod consistency;
mod healthy;
mod request;

pub use consistency::ConsistencyInfo;
pub use request::RequestInfo;

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::{DeleteParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backup::{BackupError, BackupStorageRegistry};
use crate::crd::{EtcdCluster, EtcdInspection, EtcdInspectionSpec, EtcdInspectionStatus};
use crate::cluster::ProviderError;
use crate::etcd::{ClientConfig, ClientPool, EtcdError, load_client_config};
use crate::metrics::Metrics;

/// Seconds between probe iterations when the record does not specify one
pub const DEFAULT_INSPECTION_INTERVAL: u64 = 300;
/// Default key prefix for range reads and watches
pub const DEFAULT_INSPECTION_PATH: &str = "";

#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Etcd(#[from] EtcdError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cluster {0} not found")]
    ClusterNotFound(String),
}

impl InspectionError {
    /// Configuration errors are not retried by the work queue
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            InspectionError::Config(_)
                | InspectionError::Backup(BackupError::Config(_))
                | InspectionError::Backup(BackupError::UnknownStorage(_))
                | InspectionError::Etcd(EtcdError::Config(_))
                | InspectionError::Provider(ProviderError::Config(_))
        )
    }
}

pub type Result<T, E = InspectionError> = std::result::Result<T, E>;

/// Handles owned by a long-lived request watch
struct WatchHandle {
    watch_task: JoinHandle<()>,
    process_task: JoinHandle<()>,
}

/// Shared probe executor handed to the feature providers by the composition
/// root
pub struct Server {
    client: kube::Client,
    pool: Arc<ClientPool>,
    metrics: Arc<Metrics>,
    backup_storage: Arc<BackupStorageRegistry>,
    watchers: Mutex<HashMap<String, WatchHandle>>,
}

impl Server {
    pub fn new(
        client: kube::Client,
        pool: Arc<ClientPool>,
        metrics: Arc<Metrics>,
        backup_storage: Arc<BackupStorageRegistry>,
    ) -> Self {
        Self {
            client,
            pool,
            metrics,
            backup_storage,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn kube_client(&self) -> &kube::Client {
        &self.client
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    pub(crate) fn backup_storage(&self) -> &Arc<BackupStorageRegistry> {
        &self.backup_storage
    }

    /// Fetch a cluster and resolve its client configuration from the
    /// annotation-referenced TLS secret
    pub async fn cluster_info(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<(EtcdCluster, ClientConfig)> {
        let clusters: Api<EtcdCluster> = Api::namespaced(self.client.clone(), namespace);
        let cluster = clusters
            .get_opt(cluster_name)
            .await?
            .ok_or_else(|| InspectionError::ClusterNotFound(cluster_name.to_string()))?;
        let config = load_client_config(&self.client, namespace, cluster.tls_secret_ref()).await?;
        Ok((cluster, config))
    }

    /// Whether the inspection record for a cluster/feature pair exists
    pub async fn task_exists(&self, cluster: &EtcdCluster, feature: &str) -> Result<bool> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = EtcdInspection::task_name(&cluster.name_any(), feature);
        let tasks: Api<EtcdInspection> = Api::namespaced(self.client.clone(), &namespace);
        Ok(tasks.get_opt(&name).await?.is_some())
    }

    /// Create the inspection record for a cluster/feature pair if absent
    pub async fn ensure_task(&self, cluster: &EtcdCluster, feature: &str) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = EtcdInspection::task_name(&cluster.name_any(), feature);
        let tasks: Api<EtcdInspection> = Api::namespaced(self.client.clone(), &namespace);

        if tasks.get_opt(&name).await?.is_some() {
            return Ok(());
        }

        let mut task = EtcdInspection::new(
            &name,
            EtcdInspectionSpec {
                cluster_name: cluster.name_any(),
                inspection_type: feature.to_string(),
                inspection_provider: String::new(),
                interval_in_second: 0,
            },
        );
        task.metadata.labels = cluster.metadata.labels.clone();
        task.metadata.owner_references = cluster.controller_owner_ref(&()).map(|r| vec![r]);
        task.status = Some(EtcdInspectionStatus {
            last_updated_time: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        });

        tasks.create(&PostParams::default(), &task).await?;
        tracing::info!(%name, %namespace, "created inspection task");
        Ok(())
    }

    /// Delete the inspection record for a cluster/feature pair and tear down
    /// any transient resources it held
    pub async fn remove_task(&self, cluster: &EtcdCluster, feature: &str) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let cluster_name = cluster.name_any();
        let name = EtcdInspection::task_name(&cluster_name, feature);
        let tasks: Api<EtcdInspection> = Api::namespaced(self.client.clone(), &namespace);

        match tasks.delete(&name, &DeleteParams::default()).await {
            Ok(_) => tracing::info!(%name, %namespace, "deleted inspection task"),
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        // only the request feature owns transient per-cluster resources
        if feature == crate::features::FeatureName::Request.as_str() {
            self.stop_watch(&cluster_name).await;
            self.pool.invalidate(&cluster_name).await;
        }
        Ok(())
    }

    /// Abort the long-lived watch tasks for a cluster, if any
    pub async fn stop_watch(&self, cluster_name: &str) {
        if let Some(handle) = self.watchers.lock().await.remove(cluster_name) {
            handle.watch_task.abort();
            handle.process_task.abort();
            tracing::info!(cluster = cluster_name, "stopped request watch");
        }
    }

    pub(crate) async fn watch_active(&self, cluster_name: &str) -> bool {
        self.watchers.lock().await.contains_key(cluster_name)
    }

    pub(crate) async fn register_watch(
        &self,
        cluster_name: &str,
        watch_task: JoinHandle<()>,
        process_task: JoinHandle<()>,
    ) {
        self.watchers.lock().await.insert(
            cluster_name.to_string(),
            WatchHandle {
                watch_task,
                process_task,
            },
        );
    }
}

/// Derive `etcdPrefix` and `resourceName` labels from an etcd key: split on
/// `/`, the second component is the prefix, the third the resource.
pub fn key_labels(key: &str) -> (String, String) {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() < 2 {
        return (String::new(), String::new());
    }
    (
        parts[1].to_string(),
        parts.get(2).copied().unwrap_or("").to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_labels_follow_the_slash_convention() {
        assert_eq!(
            key_labels("/registry/pods/default/nginx"),
            ("registry".to_string(), "pods".to_string())
        );
        assert_eq!(
            key_labels("/registry"),
            ("registry".to_string(), String::new())
        );
        assert_eq!(key_labels("flat"), (String::new(), String::new()));
    }

    #[test]
    fn task_names_join_cluster_and_feature() {
        assert_eq!(EtcdInspection::task_name("demo", "healthy"), "demo-healthy");
    }

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(InspectionError::Config("bad".into()).is_configuration());
        assert!(
            InspectionError::Backup(BackupError::Config("bad".into())).is_configuration()
        );
        assert!(!InspectionError::ClusterNotFound("x".into()).is_configuration());
    }
}
