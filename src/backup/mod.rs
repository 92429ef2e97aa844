//! Backup configuration and backup storage access
//!
//! The backup configuration rides on the `backup` annotation as a JSON blob;
//! storage backends expose a uniform list/stat contract used by the
//! backupcheck inspection.

mod storage;

pub use storage::{CosStorage, S3Storage};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crd::{EtcdCluster, annotations};

pub const ONE_DAY_SECONDS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("invalid backup configuration: {0}")]
    Config(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("storage error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("no backup storage registered for type {0}")]
    UnknownStorage(String),
}

pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// The `backup` annotation payload
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    pub storage_type: String,
    #[serde(default)]
    pub backup_policy: BackupPolicy,
    #[serde(default)]
    pub s3: Option<S3Source>,
    #[serde(default)]
    pub cos: Option<CosSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    #[serde(default)]
    pub backup_interval_in_second: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub timeout_in_second: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct S3Source {
    /// `bucket` or `bucket/prefix`
    pub path: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub aws_secret: String,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CosSource {
    /// `bucket` or `bucket/prefix`
    pub path: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub cos_secret: String,
}

impl BackupConfig {
    /// Parse the backup configuration from the cluster's annotation
    pub fn from_cluster(cluster: &EtcdCluster) -> Result<BackupConfig> {
        let raw = cluster.annotation(annotations::BACKUP).ok_or_else(|| {
            BackupError::Config(format!(
                "backup config not found, annotation key {} not set",
                annotations::BACKUP
            ))
        })?;
        serde_json::from_str(raw).map_err(|e| BackupError::Config(e.to_string()))
    }

    /// How many backup files the policy implies for the last day
    pub fn desired_daily_files(&self) -> u64 {
        let policy = &self.backup_policy;
        if policy.backup_interval_in_second == 0 {
            return 0;
        }
        (ONE_DAY_SECONDS / policy.backup_interval_in_second).min(policy.max_backups)
    }
}

/// One stored backup object
#[derive(Debug, Clone)]
pub struct BackupObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Uniform list/stat contract over backup storage backends
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// All backup objects the backend holds for this cluster
    async fn list(&self, cluster: &EtcdCluster) -> Result<Vec<BackupObject>>;

    /// Count objects modified within the last day
    fn stat(&self, objects: &[BackupObject]) -> usize {
        let cutoff = Utc::now() - Duration::seconds(ONE_DAY_SECONDS as i64);
        objects.iter().filter(|o| o.last_modified > cutoff).count()
    }
}

/// Storage registry keyed by the `storageType` field
#[derive(Default)]
pub struct BackupStorageRegistry {
    backends: HashMap<String, Arc<dyn BackupStorage>>,
}

impl BackupStorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend; first registration wins
    pub fn register(&mut self, storage_type: &str, backend: Arc<dyn BackupStorage>) {
        if self.backends.contains_key(storage_type) {
            tracing::warn!(storage_type, "backup storage registered twice, keeping the first");
            return;
        }
        self.backends.insert(storage_type.to_string(), backend);
    }

    pub fn get(&self, storage_type: &str) -> Result<Arc<dyn BackupStorage>> {
        self.backends
            .get(storage_type)
            .cloned()
            .ok_or_else(|| BackupError::UnknownStorage(storage_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_config_parses_annotation_payload() {
        let raw = r#"{
            "storageType": "S3",
            "backupPolicy": {"backupIntervalInSecond": 3600, "maxBackups": 24, "timeoutInSecond": 600},
            "s3": {"path": "backups/demo", "awsSecret": "aws-creds"}
        }"#;
        let config: BackupConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.storage_type, "S3");
        assert_eq!(config.backup_policy.max_backups, 24);
        assert_eq!(config.s3.as_ref().unwrap().path, "backups/demo");
    }

    #[test]
    fn desired_files_clamp_to_max_backups() {
        let config = BackupConfig {
            backup_policy: BackupPolicy {
                backup_interval_in_second: 3600,
                max_backups: 24,
                timeout_in_second: 600,
            },
            ..Default::default()
        };
        assert_eq!(config.desired_daily_files(), 24);

        let config = BackupConfig {
            backup_policy: BackupPolicy {
                backup_interval_in_second: 600,
                max_backups: 24,
                timeout_in_second: 600,
            },
            ..Default::default()
        };
        // 144 slots per day, clamped by maxBackups
        assert_eq!(config.desired_daily_files(), 24);

        let config = BackupConfig::default();
        assert_eq!(config.desired_daily_files(), 0);
    }

    struct StaticStorage(Vec<BackupObject>);

    #[async_trait]
    impl BackupStorage for StaticStorage {
        async fn list(&self, _cluster: &EtcdCluster) -> Result<Vec<BackupObject>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn stat_counts_only_the_last_day() {
        let storage = StaticStorage(vec![]);
        let objects = vec![
            BackupObject {
                key: "fresh".into(),
                last_modified: Utc::now() - Duration::hours(1),
            },
            BackupObject {
                key: "stale".into(),
                last_modified: Utc::now() - Duration::hours(30),
            },
        ];
        assert_eq!(storage.stat(&objects), 1);
    }

    #[test]
    fn unknown_storage_type_errors() {
        let registry = BackupStorageRegistry::new();
        assert!(matches!(
            registry.get("S3"),
            Err(BackupError::UnknownStorage(_))
        ));
    }
}
