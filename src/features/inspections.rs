//! Feature providers whose external state is an inspection record
//!
//! healthy, request, consistency, alarm and backupcheck all share the same
//! Equal/Sync shape: the desired external state is the presence (gate on) or
//! absence (gate off) of the `<cluster>-<feature>` EtcdInspection resource.
//! They differ only in the probe that `inspect` runs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::crd::{EtcdCluster, EtcdInspection};
use crate::inspection::Server;

use super::{FeatureName, FeatureProvider, Result, feature_enabled};

pub struct InspectionFeature {
    name: FeatureName,
    inspection: Arc<Server>,
}

impl InspectionFeature {
    pub fn new(name: FeatureName, inspection: Arc<Server>) -> Self {
        debug_assert!(
            !matches!(name, FeatureName::Monitor | FeatureName::Backup),
            "monitor and backup shape external objects, not inspection records"
        );
        Self { name, inspection }
    }
}

#[async_trait]
impl FeatureProvider for InspectionFeature {
    fn name(&self) -> FeatureName {
        self.name
    }

    async fn equal(&self, cluster: &EtcdCluster) -> bool {
        let exists = match self.inspection.task_exists(cluster, self.name.as_str()).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(feature = %self.name, "failed to check inspection task: {}", e);
                return false;
            }
        };
        if feature_enabled(cluster, self.name) {
            exists
        } else {
            !exists
        }
    }

    async fn sync(&self, cluster: &EtcdCluster) -> Result<()> {
        if feature_enabled(cluster, self.name) {
            self.inspection.ensure_task(cluster, self.name.as_str()).await
        } else {
            self.inspection.remove_task(cluster, self.name.as_str()).await
        }
    }

    async fn inspect(&self, task: &EtcdInspection) -> Result<()> {
        match self.name {
            FeatureName::Healthy => self.inspection.collect_member_healthy(task).await,
            FeatureName::Request => self.inspection.collect_cluster_request(task).await,
            FeatureName::Consistency => self.inspection.collect_cluster_consistency(task).await,
            FeatureName::Alarm => self.inspection.collect_alarm_list(task).await,
            FeatureName::BackupCheck => self.inspection.stat_backup_files(task).await,
            FeatureName::Monitor | FeatureName::Backup => Ok(()),
        }
    }
}
