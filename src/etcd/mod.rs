//! Authenticated etcd client construction and read operations
//!
//! TLS material and basic-auth credentials come from a Kubernetes secret
//! referenced by the `certName` annotation. The PEM payloads are handed
//! directly to the client builders; nothing is written to disk.

mod client;
mod pool;

pub use client::{
    EtcdClient, EtcdMember, EndpointStatus, HttpProbe, IndexMetadata, MemberAlarm,
};
pub use pool::ClientPool;

use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use std::time::Duration;
use thiserror::Error;

/// Secret keys carrying client TLS material and basic-auth credentials
pub const CLIENT_CERT_KEY: &str = "client.pem";
pub const CLIENT_KEY_KEY: &str = "client-key.pem";
pub const CLIENT_CA_KEY: &str = "ca.pem";
pub const CLIENT_USERNAME_KEY: &str = "username";
pub const CLIENT_PASSWORD_KEY: &str = "password";

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors surfaced by etcd client construction and operations
#[derive(Error, Debug)]
pub enum EtcdError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("etcd unavailable: {0}")]
    Unavailable(String),

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

pub type Result<T, E = EtcdError> = std::result::Result<T, E>;

/// A parsed secret reference from the `certName` annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    /// Parse `""`, `"name"` or `"namespace/name"`; anything with more
    /// slashes is a configuration error.
    pub fn parse(reference: &str, default_namespace: &str) -> Result<Option<SecretRef>> {
        if reference.is_empty() {
            return Ok(None);
        }
        let parts: Vec<&str> = reference.split('/').collect();
        match parts.as_slice() {
            [name] => Ok(Some(SecretRef {
                namespace: default_namespace.to_string(),
                name: name.to_string(),
            })),
            [namespace, name] => Ok(Some(SecretRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })),
            _ => Err(EtcdError::Config(format!(
                "invalid secret reference {:?}",
                reference
            ))),
        }
    }
}

/// Client TLS material, as PEM bytes
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

/// Everything needed to build a v3 or v2 client for one cluster
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub keep_alive_time: Duration,
    pub keep_alive_timeout: Duration,
    pub tls: Option<TlsMaterial>,
    pub username: String,
    pub password: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keep_alive_time: DEFAULT_KEEPALIVE_TIME,
            keep_alive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            tls: None,
            username: String::new(),
            password: String::new(),
        }
    }
}

impl ClientConfig {
    /// Copy of this config addressing a single endpoint
    pub fn for_endpoint(&self, endpoint: &str) -> ClientConfig {
        ClientConfig {
            endpoints: vec![endpoint.to_string()],
            ..self.clone()
        }
    }
}

/// Resolve the client configuration for a cluster from its secret reference.
///
/// An empty reference yields an insecure default configuration. When any of
/// the three PEM payloads is present, all three are required.
pub async fn load_client_config(
    client: &kube::Client,
    default_namespace: &str,
    secret_ref: &str,
) -> Result<ClientConfig> {
    let Some(secret_ref) = SecretRef::parse(secret_ref, default_namespace)? else {
        return Ok(ClientConfig::default());
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let secret = secrets.get(&secret_ref.name).await.map_err(|e| {
        tracing::error!(
            namespace = %secret_ref.namespace,
            secret = %secret_ref.name,
            "failed to get TLS secret: {}",
            e
        );
        e
    })?;

    let data = secret.data.unwrap_or_default();
    let field = |key: &str| data.get(key).map(|v| v.0.clone()).unwrap_or_default();

    let ca = field(CLIENT_CA_KEY);
    let cert = field(CLIENT_CERT_KEY);
    let key = field(CLIENT_KEY_KEY);

    let tls = if ca.is_empty() && cert.is_empty() && key.is_empty() {
        None
    } else if ca.is_empty() || cert.is_empty() || key.is_empty() {
        return Err(EtcdError::Config(format!(
            "secret {}/{} must carry {}, {} and {} together",
            secret_ref.namespace, secret_ref.name, CLIENT_CA_KEY, CLIENT_CERT_KEY, CLIENT_KEY_KEY
        )));
    } else {
        Some(TlsMaterial { ca, cert, key })
    };

    Ok(ClientConfig {
        username: String::from_utf8(field(CLIENT_USERNAME_KEY)).unwrap_or_default(),
        password: String::from_utf8(field(CLIENT_PASSWORD_KEY)).unwrap_or_default(),
        tls,
        ..ClientConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_ref_forms() {
        assert_eq!(SecretRef::parse("", "default").unwrap(), None);
        assert_eq!(
            SecretRef::parse("certs", "default").unwrap(),
            Some(SecretRef {
                namespace: "default".into(),
                name: "certs".into()
            })
        );
        assert_eq!(
            SecretRef::parse("kstone/certs", "default").unwrap(),
            Some(SecretRef {
                namespace: "kstone".into(),
                name: "certs".into()
            })
        );
    }

    #[test]
    fn secret_ref_rejects_extra_slashes() {
        assert!(SecretRef::parse("a/b/c", "default").is_err());
    }

    #[test]
    fn default_config_timeouts() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.dial_timeout, Duration::from_secs(3));
        assert_eq!(cfg.keep_alive_time, Duration::from_secs(10));
        assert_eq!(cfg.keep_alive_timeout, Duration::from_secs(30));
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn for_endpoint_narrows_endpoints() {
        let cfg = ClientConfig {
            endpoints: vec!["https://a:2379".into(), "https://b:2379".into()],
            ..ClientConfig::default()
        };
        let single = cfg.for_endpoint("https://b:2379");
        assert_eq!(single.endpoints, vec!["https://b:2379".to_string()]);
    }
}
