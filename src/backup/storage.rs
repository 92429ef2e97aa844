//! S3 and COS backends over `object_store`
//!
//! COS speaks the S3 protocol, so both backends share the same builder path
//! and differ only in which annotation block and credentials secret they
//! read.

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;

use crate::crd::EtcdCluster;

use super::{BackupConfig, BackupError, BackupObject, BackupStorage, Result};

/// Namespace holding backup credential secrets
const CREDENTIALS_NAMESPACE: &str = "kstone";

const ACCESS_KEY: &str = "accessKey";
const SECRET_KEY: &str = "secretKey";
const REGION_KEY: &str = "region";

struct Credentials {
    access_key: String,
    secret_key: String,
    region: String,
}

async fn load_credentials(client: &Client, secret_name: &str) -> Result<Credentials> {
    if secret_name.is_empty() {
        return Err(BackupError::Config(
            "backup credentials secret not set".into(),
        ));
    }
    let secrets: Api<Secret> = Api::namespaced(client.clone(), CREDENTIALS_NAMESPACE);
    let secret = secrets.get(secret_name).await?;
    let data = secret.data.unwrap_or_default();

    let field = |key: &str| -> Result<String> {
        data.get(key)
            .map(|v| String::from_utf8_lossy(&v.0).to_string())
            .ok_or_else(|| {
                BackupError::Config(format!("secret {} missing key {}", secret_name, key))
            })
    };

    Ok(Credentials {
        access_key: field(ACCESS_KEY)?,
        secret_key: field(SECRET_KEY)?,
        region: data
            .get(REGION_KEY)
            .map(|v| String::from_utf8_lossy(&v.0).to_string())
            .unwrap_or_else(|| "us-east-1".to_string()),
    })
}

/// Split a `bucket` or `bucket/prefix` path
fn split_bucket_path(path: &str) -> Result<(String, Option<ObjectPath>)> {
    let mut parts = path.splitn(2, '/');
    let bucket = parts
        .next()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| BackupError::Config(format!("bucket not set in path {:?}", path)))?;
    let prefix = parts
        .next()
        .filter(|p| !p.is_empty())
        .map(ObjectPath::from);
    Ok((bucket.to_string(), prefix))
}

async fn list_bucket(
    credentials: Credentials,
    endpoint: &str,
    path: &str,
    force_path_style: bool,
) -> Result<Vec<BackupObject>> {
    let (bucket, prefix) = split_bucket_path(path)?;

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_access_key_id(credentials.access_key)
        .with_secret_access_key(credentials.secret_key)
        .with_region(credentials.region)
        .with_virtual_hosted_style_request(!force_path_style);
    if !endpoint.is_empty() {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }
    let store = builder.build()?;

    let objects: Vec<_> = store.list(prefix.as_ref()).try_collect().await?;
    Ok(objects
        .into_iter()
        .map(|meta| BackupObject {
            key: meta.location.to_string(),
            last_modified: meta.last_modified,
        })
        .collect())
}

/// AWS S3 backup storage
pub struct S3Storage {
    client: Client,
}

impl S3Storage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackupStorage for S3Storage {
    async fn list(&self, cluster: &EtcdCluster) -> Result<Vec<BackupObject>> {
        let config = BackupConfig::from_cluster(cluster)?;
        let source = config
            .s3
            .ok_or_else(|| BackupError::Config("s3 block missing in backup config".into()))?;
        let credentials = load_credentials(&self.client, &source.aws_secret).await?;
        list_bucket(
            credentials,
            &source.endpoint,
            &source.path,
            source.force_path_style,
        )
        .await
    }
}

/// Tencent COS backup storage (S3-compatible endpoint)
pub struct CosStorage {
    client: Client,
}

impl CosStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BackupStorage for CosStorage {
    async fn list(&self, cluster: &EtcdCluster) -> Result<Vec<BackupObject>> {
        let config = BackupConfig::from_cluster(cluster)?;
        let source = config
            .cos
            .ok_or_else(|| BackupError::Config("cos block missing in backup config".into()))?;
        if source.endpoint.is_empty() {
            return Err(BackupError::Config(
                "cos backup config requires an endpoint".into(),
            ));
        }
        let credentials = load_credentials(&self.client, &source.cos_secret).await?;
        // COS only supports path-style addressing through custom endpoints
        list_bucket(credentials, &source.endpoint, &source.path, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_path_splits() {
        let (bucket, prefix) = split_bucket_path("backups/demo/snapshots").unwrap();
        assert_eq!(bucket, "backups");
        assert_eq!(prefix.unwrap().to_string(), "demo/snapshots");

        let (bucket, prefix) = split_bucket_path("backups").unwrap();
        assert_eq!(bucket, "backups");
        assert!(prefix.is_none());
    }

    #[test]
    fn empty_bucket_is_rejected() {
        assert!(split_bucket_path("").is_err());
    }
}
