//! etcd read operations: v3 over gRPC, v2 and `/health` over HTTP(S)

use std::time::Duration;

use etcd_client::{
    AlarmAction, AlarmType, Certificate, Client, ConnectOptions, GetOptions, Identity, TlsOptions,
};
use serde::Deserialize;

use super::{ClientConfig, EtcdError, Result, TlsMaterial};

/// One entry of the cluster member list
#[derive(Debug, Clone)]
pub struct EtcdMember {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

/// Runtime status of a single endpoint
#[derive(Debug, Clone, Default)]
pub struct EndpointStatus {
    pub version: String,
    pub leader: u64,
    pub raft_index: u64,
    pub raft_applied_index: u64,
    pub revision: u64,
    pub is_learner: bool,
    pub errors: Vec<String>,
}

/// An active alarm reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAlarm {
    pub member_id: u64,
    /// NOSPACE or CORRUPT
    pub kind: String,
}

/// Consistency-relevant metadata of one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexMetadata {
    pub revision: u64,
    pub raft_applied_index: u64,
    pub raft_index: u64,
}

/// A connected etcd v3 client bound to one cluster's endpoints
#[derive(Clone)]
pub struct EtcdClient {
    inner: Client,
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdClient").finish_non_exhaustive()
    }
}

fn classify(err: etcd_client::Error) -> EtcdError {
    let msg = err.to_string();
    let lowered = msg.to_ascii_lowercase();
    if lowered.contains("unauthenticated")
        || lowered.contains("permission denied")
        || lowered.contains("invalid user")
        || lowered.contains("authentication")
    {
        EtcdError::Auth(msg)
    } else if lowered.contains("deadline")
        || lowered.contains("timed out")
        || lowered.contains("transport")
        || lowered.contains("connect")
        || lowered.contains("unavailable")
    {
        EtcdError::Network(msg)
    } else {
        EtcdError::Unavailable(msg)
    }
}

fn connect_options(config: &ClientConfig) -> Result<ConnectOptions> {
    let mut options = ConnectOptions::new()
        .with_connect_timeout(config.dial_timeout)
        .with_keep_alive(config.keep_alive_time, config.keep_alive_timeout)
        .with_keep_alive_while_idle(true);

    if !config.username.is_empty() {
        options = options.with_user(config.username.clone(), config.password.clone());
    }

    if let Some(tls) = &config.tls {
        if tls.ca.is_empty() || tls.cert.is_empty() || tls.key.is_empty() {
            return Err(EtcdError::Config(
                "TLS material requires ca, cert and key together".into(),
            ));
        }
        let tls_options = TlsOptions::new()
            .ca_certificate(Certificate::from_pem(tls.ca.clone()))
            .identity(Identity::from_pem(tls.cert.clone(), tls.key.clone()));
        options = options.with_tls(tls_options);
    }

    Ok(options)
}

impl EtcdClient {
    /// Dial the configured endpoints
    pub async fn connect(config: &ClientConfig) -> Result<EtcdClient> {
        if config.endpoints.is_empty() {
            return Err(EtcdError::Config("no endpoints configured".into()));
        }
        let options = connect_options(config)?;
        let inner = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(classify)?;
        Ok(EtcdClient { inner })
    }

    /// List the cluster members
    pub async fn member_list(&self) -> Result<Vec<EtcdMember>> {
        let mut client = self.inner.clone();
        let response = client.member_list().await.map_err(classify)?;
        Ok(response
            .members()
            .iter()
            .map(|m| EtcdMember {
                id: m.id(),
                name: m.name().to_string(),
                peer_urls: m.peer_urls().to_vec(),
                client_urls: m.client_urls().to_vec(),
                is_learner: m.is_learner(),
            })
            .collect())
    }

    /// Status of the endpoint this client is bound to.
    ///
    /// The revision rides on the header of a count-only range read since the
    /// status RPC does not carry it.
    pub async fn endpoint_status(&self) -> Result<EndpointStatus> {
        let mut client = self.inner.clone();
        let status = client.status().await.map_err(classify)?;

        let revision = match client
            .get("", Some(GetOptions::new().with_all_keys().with_count_only()))
            .await
        {
            Ok(resp) => resp.header().map(|h| h.revision() as u64).unwrap_or(0),
            Err(e) => {
                tracing::warn!("failed to read revision header: {}", e);
                0
            }
        };

        Ok(EndpointStatus {
            version: status.version().to_string(),
            leader: status.leader(),
            raft_index: status.raft_index(),
            raft_applied_index: status.raft_applied_index(),
            revision,
            is_learner: status.is_learner(),
            errors: status.errors().to_vec(),
        })
    }

    /// Active alarms, restricted to the NOSPACE/CORRUPT kinds we understand
    pub async fn alarm_list(&self) -> Result<Vec<MemberAlarm>> {
        let mut client = self.inner.clone();
        let response = client
            .alarm(AlarmAction::Get, AlarmType::None, None)
            .await
            .map_err(classify)?;
        Ok(response
            .alarms()
            .iter()
            .filter_map(|a| {
                let kind = match a.alarm() {
                    AlarmType::Nospace => "NOSPACE",
                    AlarmType::Corrupt => "CORRUPT",
                    AlarmType::None => return None,
                };
                Some(MemberAlarm {
                    member_id: a.member_id(),
                    kind: kind.to_string(),
                })
            })
            .collect())
    }

    /// Count keys under a prefix with a count-only range read
    pub async fn key_count(&self, prefix: &str) -> Result<u64> {
        let mut client = self.inner.clone();
        let options = if prefix.is_empty() {
            GetOptions::new().with_all_keys().with_count_only()
        } else {
            GetOptions::new().with_prefix().with_count_only()
        };
        let response = client.get(prefix, Some(options)).await.map_err(classify)?;
        Ok(response.count() as u64)
    }

    /// Keys under a prefix, keys only, sorted ascending
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut client = self.inner.clone();
        let options = if prefix.is_empty() {
            GetOptions::new().with_all_keys()
        } else {
            GetOptions::new().with_prefix()
        }
        .with_keys_only()
        .with_sort(etcd_client::SortTarget::Key, etcd_client::SortOrder::Ascend);
        let response = client.get(prefix, Some(options)).await.map_err(classify)?;
        Ok(response
            .kvs()
            .iter()
            .filter_map(|kv| kv.key_str().ok().map(|k| k.to_string()))
            .collect())
    }

    /// Revision and raft indices of the bound endpoint
    pub async fn index_metadata(&self) -> Result<IndexMetadata> {
        let status = self.endpoint_status().await?;
        Ok(IndexMetadata {
            revision: status.revision,
            raft_applied_index: status.raft_applied_index,
            raft_index: status.raft_index,
        })
    }

    /// Access to the underlying client for watch plumbing
    pub fn raw(&self) -> Client {
        self.inner.clone()
    }
}

/// TLS-aware HTTP probe used for `/health`, `/version` and the etcd v2 API
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HealthBody {
    health: String,
}

#[derive(Deserialize)]
struct VersionBody {
    etcdserver: String,
}

#[derive(Deserialize)]
struct V2SelfStats {
    id: String,
    name: String,
    #[serde(rename = "leaderInfo", default)]
    leader_info: V2LeaderInfo,
}

#[derive(Deserialize, Default)]
struct V2LeaderInfo {
    #[serde(default)]
    leader: String,
}

#[derive(Deserialize, Default)]
struct V2Node {
    #[serde(default)]
    nodes: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct V2KeysBody {
    #[serde(default)]
    node: V2Node,
}

impl HttpProbe {
    /// Build a probe client for one set of TLS material.
    ///
    /// Certificate verification is relaxed the way the original forced
    /// `InsecureSkipVerify`, so IP-addressed endpoints keep working.
    pub fn new(tls: Option<&TlsMaterial>) -> Result<HttpProbe> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .danger_accept_invalid_certs(true);

        if let Some(tls) = tls {
            let mut identity_pem = tls.cert.clone();
            identity_pem.extend_from_slice(&tls.key);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| EtcdError::Config(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
            if let Ok(ca) = reqwest::Certificate::from_pem(&tls.ca) {
                builder = builder.add_root_certificate(ca);
            }
        }

        Ok(HttpProbe {
            client: builder
                .build()
                .map_err(|e| EtcdError::Config(format!("failed to build http client: {}", e)))?,
        })
    }

    /// `GET <endpoint>/health`; body `health == "true"` means healthy, any
    /// other value or transport failure means unhealthy.
    pub async fn health_check(&self, endpoint: &str) -> bool {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => match response.json::<HealthBody>().await {
                Ok(body) => body.health == "true",
                Err(e) => {
                    tracing::warn!(endpoint, "health body unreadable: {}", e);
                    false
                }
            },
            Err(e) => {
                tracing::warn!(endpoint, "health check failed: {}", e);
                false
            }
        }
    }

    /// etcd server version from `GET <endpoint>/version`
    pub async fn version(&self, endpoint: &str) -> Result<String> {
        let url = format!("{}/version", endpoint.trim_end_matches('/'));
        let body: VersionBody = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EtcdError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| EtcdError::Unavailable(e.to_string()))?;
        Ok(body.etcdserver)
    }

    /// Member id, name and leader id from the v2 self-stats endpoint
    pub async fn v2_self_stats(&self, endpoint: &str) -> Result<(String, String, String)> {
        let url = format!("{}/v2/stats/self", endpoint.trim_end_matches('/'));
        let body: V2SelfStats = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EtcdError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| EtcdError::Unavailable(e.to_string()))?;
        Ok((body.id, body.name, body.leader_info.leader))
    }

    /// Approximate v2 key count: a non-recursive quorum-sorted read, plus the
    /// store index from the `X-Etcd-Index` header.
    pub async fn v2_key_count(&self, endpoint: &str, prefix: &str) -> Result<(u64, u64)> {
        let path = if prefix.is_empty() { "/" } else { prefix };
        let url = format!(
            "{}/v2/keys{}?quorum=true&sorted=true",
            endpoint.trim_end_matches('/'),
            path
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EtcdError::Network(e.to_string()))?;

        let index = response
            .headers()
            .get("X-Etcd-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let body: V2KeysBody = response
            .json()
            .await
            .map_err(|e| EtcdError::Unavailable(e.to_string()))?;

        Ok((body.node.nodes.len() as u64 + index, index))
    }

    /// v2 rendition of the consistency metadata: the store index stands in
    /// for the revision, the raft columns stay zero.
    pub async fn v2_index_metadata(&self, endpoint: &str) -> Result<IndexMetadata> {
        let (_, index) = self.v2_key_count(endpoint, "/").await?;
        Ok(IndexMetadata {
            revision: index,
            raft_applied_index: 0,
            raft_index: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_options_require_complete_tls_material() {
        let config = ClientConfig {
            tls: Some(TlsMaterial {
                ca: b"ca".to_vec(),
                cert: Vec::new(),
                key: b"key".to_vec(),
            }),
            ..ClientConfig::default()
        };
        assert!(matches!(
            connect_options(&config),
            Err(EtcdError::Config(_))
        ));
    }

    #[test]
    fn connect_rejects_empty_endpoints() {
        let config = ClientConfig::default();
        let err = futures::executor::block_on(EtcdClient::connect(&config)).unwrap_err();
        assert!(matches!(err, EtcdError::Config(_)));
    }

    #[test]
    fn health_body_parses() {
        let body: HealthBody = serde_json::from_str(r#"{"health":"true"}"#).unwrap();
        assert_eq!(body.health, "true");
        let body: HealthBody = serde_json::from_str(r#"{"health":"false"}"#).unwrap();
        assert_ne!(body.health, "true");
    }

    #[test]
    fn v2_keys_body_counts_nodes() {
        let body: V2KeysBody = serde_json::from_str(
            r#"{"action":"get","node":{"dir":true,"nodes":[{"key":"/a"},{"key":"/b"}]}}"#,
        )
        .unwrap();
        assert_eq!(body.node.nodes.len(), 2);
    }
}
