//! Shared context and composition root for the controllers
//!
//! The context owns every pluggable registry: cluster providers, feature
//! providers and backup storage backends are constructed here, once, and
//! handed into the reconcilers. Nothing self-registers at import time.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::backup::{BackupStorageRegistry, CosStorage, S3Storage};
use crate::cluster::{ClusterProviderRegistry, ImportedClusterProvider};
use crate::crd::{EtcdCluster, EtcdClusterType};
use crate::etcd::ClientPool;
use crate::features::{BackupFeature, FeatureName, FeatureRegistry, InspectionFeature, MonitorFeature};
use crate::health::HealthState;
use crate::inspection;

/// Field manager name for the operator
pub(crate) const FIELD_MANAGER: &str = "kstone-operator";

/// Shared context for both controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Health and metrics state
    pub health_state: Arc<HealthState>,
    /// etcd client pool
    pub pool: Arc<ClientPool>,
    /// Cluster lifecycle providers by cluster type
    pub cluster_providers: Arc<ClusterProviderRegistry>,
    /// Feature providers by feature name
    pub features: Arc<FeatureRegistry>,
    /// Shared probe executor
    pub inspection: Arc<inspection::Server>,
}

impl Context {
    /// Build the full provider wiring around one Kubernetes client
    pub fn new(client: Client, health_state: Arc<HealthState>) -> Self {
        let pool = Arc::new(ClientPool::new());

        let mut backup_storage = BackupStorageRegistry::new();
        backup_storage.register("S3", Arc::new(S3Storage::new(client.clone())));
        backup_storage.register("COS", Arc::new(CosStorage::new(client.clone())));
        let backup_storage = Arc::new(backup_storage);

        let inspection = Arc::new(inspection::Server::new(
            client.clone(),
            Arc::clone(&pool),
            Arc::clone(&health_state.metrics),
            backup_storage,
        ));

        let mut cluster_providers = ClusterProviderRegistry::new();
        cluster_providers.register(
            EtcdClusterType::Imported,
            Arc::new(ImportedClusterProvider::new(Arc::clone(&pool))),
        );

        let mut features = FeatureRegistry::new();
        features.register(Arc::new(MonitorFeature::new(client.clone())));
        features.register(Arc::new(BackupFeature::new(client.clone())));
        for name in [
            FeatureName::Healthy,
            FeatureName::Request,
            FeatureName::Consistency,
            FeatureName::Alarm,
            FeatureName::BackupCheck,
        ] {
            features.register(Arc::new(InspectionFeature::new(
                name,
                Arc::clone(&inspection),
            )));
        }

        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
            pool,
            cluster_providers: Arc::new(cluster_providers),
            features: Arc::new(features),
            inspection,
        }
    }

    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a warning event for a cluster
    pub async fn publish_warning_event(
        &self,
        cluster: &EtcdCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Warning,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish event: {}", e);
        }
    }

    /// Publish a normal event for a cluster
    pub async fn publish_normal_event(
        &self,
        cluster: &EtcdCluster,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = cluster.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!("Failed to publish event: {}", e);
        }
    }
}
