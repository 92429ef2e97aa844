//! Backup file accounting probe

use kube::{Api, ResourceExt};

use crate::backup::BackupConfig;
use crate::crd::{EtcdCluster, EtcdInspection};
use crate::metrics::ClusterLabels;

use super::{Result, Server};

impl Server {
    /// Count the backup files stored in the last day and publish the actual
    /// and deficit gauges
    pub async fn stat_backup_files(&self, task: &EtcdInspection) -> Result<()> {
        let namespace = task.namespace().unwrap_or_default();
        let clusters: Api<EtcdCluster> = Api::namespaced(self.kube_client().clone(), &namespace);
        let Some(cluster) = clusters.get_opt(&task.spec.cluster_name).await? else {
            // the owning cluster is gone, nothing to account for
            return Ok(());
        };

        let config = BackupConfig::from_cluster(&cluster)?;
        let storage = self.backup_storage().get(&config.storage_type)?;

        let objects = storage.list(&cluster).await?;
        let actual = storage.stat(&objects);
        let desired = config.desired_daily_files();
        let failed = desired.saturating_sub(actual as u64);

        let labels = ClusterLabels {
            cluster: cluster.name_any(),
        };
        self.metrics()
            .backup_files
            .get_or_create(&labels)
            .set(actual as i64);
        self.metrics()
            .failed_backup_files
            .get_or_create(&labels)
            .set(failed as i64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::backup::{BackupConfig, BackupPolicy};

    #[test]
    fn deficit_math_matches_the_policy() {
        let config = BackupConfig {
            backup_policy: BackupPolicy {
                backup_interval_in_second: 3600,
                max_backups: 24,
                timeout_in_second: 600,
            },
            ..Default::default()
        };
        let desired = config.desired_daily_files();
        assert_eq!(desired, 24);
        let actual: u64 = 10;
        assert_eq!(desired.saturating_sub(actual), 14);

        // surplus clamps at zero
        let actual: u64 = 30;
        assert_eq!(desired.saturating_sub(actual), 0);
    }
}
