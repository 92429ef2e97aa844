//! Backup descriptor shaping
//!
//! Writes the external `EtcdBackup` object the backup operator consumes,
//! assembled from the `backup` annotation. The descriptor carries the
//! cluster's TLS and basic-auth secret wiring when the client secret holds
//! the corresponding material.

use async_trait::async_trait;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;

use crate::backup::BackupConfig;
use crate::crd::{EtcdCluster, EtcdInspection};
use crate::etcd::load_client_config;
use crate::inspection::InspectionError;

use super::{FeatureName, FeatureProvider, Result, feature_enabled};

const FIELD_MANAGER: &str = "kstone-operator";

pub struct BackupFeature {
    client: Client,
}

impl BackupFeature {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn backup_api(&self, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("etcd.database.coreos.com", "v1beta2", "EtcdBackup");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "etcdbackups");
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }

    async fn desired(&self, cluster: &EtcdCluster) -> Result<DynamicObject> {
        let namespace = cluster.namespace().unwrap_or_default();
        let config = BackupConfig::from_cluster(cluster)?;

        let secret_ref = cluster.tls_secret_ref();
        if cluster.spec.auth_config.enable_tls && secret_ref.is_empty() {
            return Err(InspectionError::Config(format!(
                "cluster {} enables TLS but carries no certName annotation",
                cluster.name_any()
            )));
        }
        let secret_name = secret_ref
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(secret_ref)
            .to_string();

        let service_name = cluster
            .status
            .as_ref()
            .map(|s| s.service_name.clone())
            .unwrap_or_default();

        let mut spec = json!({
            "etcdEndpoints": [service_name],
            "storageType": config.storage_type,
            "backupPolicy": config.backup_policy,
        });
        if let Some(s3) = &config.s3 {
            spec["s3"] = serde_json::to_value(s3)
                .map_err(|e| InspectionError::Config(e.to_string()))?;
        }
        if let Some(cos) = &config.cos {
            spec["cos"] = serde_json::to_value(cos)
                .map_err(|e| InspectionError::Config(e.to_string()))?;
        }

        // wire the auth secrets the same way the client pool reads them
        let client_config = load_client_config(&self.client, &namespace, secret_ref).await?;
        if !client_config.username.is_empty() {
            spec["basicAuthSecret"] = json!(secret_name);
        }
        if client_config.tls.is_some() {
            spec["clientTLSSecret"] = json!(secret_name);
            spec["insecureSkipVerify"] = json!(true);
        }

        let gvk = GroupVersionKind::gvk("etcd.database.coreos.com", "v1beta2", "EtcdBackup");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "etcdbackups");
        let mut backup = DynamicObject::new(&cluster.name_any(), &resource);
        backup.data = json!({ "spec": spec });
        backup.metadata.namespace = Some(namespace);
        backup.metadata.labels = cluster.metadata.labels.clone();
        backup.metadata.owner_references = cluster.controller_owner_ref(&()).map(|r| vec![r]);
        Ok(backup)
    }
}

#[async_trait]
impl FeatureProvider for BackupFeature {
    fn name(&self) -> FeatureName {
        FeatureName::Backup
    }

    async fn equal(&self, cluster: &EtcdCluster) -> bool {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let existing = match self.backup_api(&namespace).get_opt(&name).await {
            Ok(existing) => existing,
            Err(e) => {
                tracing::warn!(cluster = %name, "failed to get backup descriptor: {}", e);
                return false;
            }
        };

        if !feature_enabled(cluster, FeatureName::Backup) {
            return existing.is_none();
        }

        let Some(existing) = existing else {
            return false;
        };
        match self.desired(cluster).await {
            Ok(desired) => existing.data.get("spec") == desired.data.get("spec"),
            Err(e) => {
                tracing::warn!(cluster = %name, "failed to shape backup descriptor: {}", e);
                false
            }
        }
    }

    async fn sync(&self, cluster: &EtcdCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        let api = self.backup_api(&namespace);

        if feature_enabled(cluster, FeatureName::Backup) {
            let desired = self.desired(cluster).await?;
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&desired),
            )
            .await?;
            tracing::info!(cluster = %name, "synced backup descriptor");
            Ok(())
        } else {
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    tracing::info!(cluster = %name, "removed backup descriptor");
                    Ok(())
                }
                Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    async fn inspect(&self, _task: &EtcdInspection) -> Result<()> {
        Ok(())
    }
}
