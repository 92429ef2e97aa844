//! Shared status-probe helpers used by cluster providers

use std::collections::HashMap;
use std::sync::Arc;

use crate::crd::{EtcdCluster, EtcdClusterPhase, EtcdMemberRole, MemberPhase, MemberStatus};
use crate::etcd::{ClientConfig, ClientPool, HttpProbe};

use super::{ProviderError, Result};

/// Endpoints external probers use to reach the cluster's members
pub fn storage_member_endpoints(cluster: &EtcdCluster) -> Vec<String> {
    cluster
        .status
        .as_ref()
        .map(|s| {
            s.members
                .iter()
                .map(|m| m.extension_client_url.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the `extClientURL` annotation, `host:port->host:port,…`
pub fn parse_extension_url_map(raw: &str) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    if raw.is_empty() {
        return Ok(map);
    }
    for item in raw.split(',') {
        match item.split_once("->") {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                map.insert(from.to_string(), to.to_string());
            }
            _ => {
                return Err(ProviderError::Config(format!(
                    "invalid extClientURL entry {:?}",
                    item
                )));
            }
        }
    }
    Ok(map)
}

/// Split `scheme://host:port` or `host:port` into host and port
pub fn split_host_port(url: &str) -> Option<(String, String)> {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let (host, port) = stripped.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    Some((host.to_string(), port.to_string()))
}

/// Rewrite an advertised client URL through the extension map; entries are
/// keyed by `host:port` without scheme, and a miss falls through to the raw
/// URL.
pub fn rewrite_client_url(client_url: &str, map: &HashMap<String, String>) -> String {
    if map.is_empty() {
        return client_url.to_string();
    }
    let (scheme, rest) = if let Some(rest) = client_url.strip_prefix("https://") {
        ("https://", rest)
    } else if let Some(rest) = client_url.strip_prefix("http://") {
        ("http://", rest)
    } else {
        ("", client_url)
    };
    match map.get(rest) {
        Some(rewritten) => format!("{}{}", scheme, rewritten),
        None => client_url.to_string(),
    }
}

/// Fetch the runtime member list and fill per-member version/role from each
/// endpoint's status. Members whose endpoint cannot be queried keep the
/// UnStarted/Unknown defaults and carry the error.
pub async fn runtime_members(
    pool: &Arc<ClientPool>,
    cluster_name: &str,
    config: &ClientConfig,
    extension_urls: &str,
) -> Result<Vec<MemberStatus>> {
    let client = pool.cluster_client(cluster_name, config).await?;
    let members = client.member_list().await?;
    let url_map = parse_extension_url_map(extension_urls)?;

    let mut statuses = Vec::with_capacity(members.len());
    for member in members {
        let Some(client_url) = member.client_urls.first() else {
            continue;
        };
        let Some((endpoint, port)) = split_host_port(client_url) else {
            continue;
        };
        let extension_client_url = rewrite_client_url(client_url, &url_map);

        let mut status = MemberStatus {
            name: member.name.clone(),
            member_id: member.id.to_string(),
            status: MemberPhase::UnStarted,
            version: String::new(),
            endpoint,
            port,
            client_url: client_url.clone(),
            extension_client_url: extension_client_url.clone(),
            role: EtcdMemberRole::Unknown,
            errors: Vec::new(),
        };

        match pool.endpoint_client(config, &extension_client_url).await {
            Ok(endpoint_client) => match endpoint_client.endpoint_status().await {
                Ok(endpoint_status) => {
                    status.status = MemberPhase::Running;
                    status.version = endpoint_status.version;
                    status.role = if endpoint_status.is_learner {
                        EtcdMemberRole::Learner
                    } else if endpoint_status.leader == member.id {
                        EtcdMemberRole::Leader
                    } else {
                        EtcdMemberRole::Follower
                    };
                    status.errors = endpoint_status.errors;
                }
                Err(e) => {
                    tracing::warn!(
                        cluster = cluster_name,
                        endpoint = %extension_client_url,
                        "failed to get member status: {}",
                        e
                    );
                    status.errors.push(e.to_string());
                }
            },
            Err(e) => {
                tracing::warn!(
                    cluster = cluster_name,
                    endpoint = %extension_client_url,
                    "failed to dial member: {}",
                    e
                );
                status.errors.push(e.to_string());
            }
        }

        statuses.push(status);
    }

    Ok(statuses)
}

/// Probe each member's `/health` and derive the member phases plus the
/// worst-member cluster phase. A probe that cannot even be constructed
/// leaves members Unknown.
pub async fn member_health(
    probe: Result<HttpProbe, crate::etcd::EtcdError>,
    mut members: Vec<MemberStatus>,
) -> (Vec<MemberStatus>, EtcdClusterPhase) {
    let mut cluster_phase = EtcdClusterPhase::Running;

    let probe = match probe {
        Ok(probe) => probe,
        Err(e) => {
            tracing::warn!("failed to build health probe: {}", e);
            for member in &mut members {
                member.status = MemberPhase::Unknown;
                member.errors.push(e.to_string());
            }
            return (members, EtcdClusterPhase::Unhealthy);
        }
    };

    for member in &mut members {
        member.status = if probe.health_check(&member.extension_client_url).await {
            MemberPhase::Running
        } else {
            MemberPhase::Unhealthy
        };
        if member.status != MemberPhase::Running && cluster_phase == EtcdClusterPhase::Running {
            cluster_phase = EtcdClusterPhase::Unhealthy;
        }
    }

    (members, cluster_phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_map_parses_pairs() {
        let map = parse_extension_url_map("1.2.3.4:2379->5.6.7.8:32379,a:1->b:2").unwrap();
        assert_eq!(map.get("1.2.3.4:2379").unwrap(), "5.6.7.8:32379");
        assert_eq!(map.get("a:1").unwrap(), "b:2");
    }

    #[test]
    fn extension_map_rejects_malformed_entries() {
        assert!(parse_extension_url_map("1.2.3.4:2379").is_err());
        assert!(parse_extension_url_map("->x:1").is_err());
    }

    #[test]
    fn rewrite_preserves_scheme_and_falls_back() {
        let map = parse_extension_url_map("10.0.0.5:2379->192.168.1.1:32379").unwrap();
        assert_eq!(
            rewrite_client_url("https://10.0.0.5:2379", &map),
            "https://192.168.1.1:32379"
        );
        assert_eq!(
            rewrite_client_url("http://10.0.0.5:2379", &map),
            "http://192.168.1.1:32379"
        );
        // no mapping entry: raw client URL wins
        assert_eq!(
            rewrite_client_url("http://10.0.0.6:2379", &map),
            "http://10.0.0.6:2379"
        );
    }

    #[test]
    fn host_port_split_handles_schemes() {
        assert_eq!(
            split_host_port("https://10.0.0.5:2379"),
            Some(("10.0.0.5".into(), "2379".into()))
        );
        assert_eq!(
            split_host_port("10.0.0.5:2379"),
            Some(("10.0.0.5".into(), "2379".into()))
        );
        assert_eq!(split_host_port("nocolon"), None);
    }

    #[test]
    fn storage_endpoints_come_from_extension_urls() {
        let mut cluster = EtcdCluster::new(
            "demo",
            crate::crd::EtcdClusterSpec {
                name: "demo".into(),
                description: String::new(),
                cluster_type: crate::crd::EtcdClusterType::Imported,
                size: 1,
                disk_type: String::new(),
                disk_size: 0,
                version: "3.5.9".into(),
                repository: String::new(),
                args: vec![],
                env: vec![],
                resources: None,
                affinity: None,
                tolerations: None,
                auth_config: Default::default(),
            },
        );
        assert!(storage_member_endpoints(&cluster).is_empty());

        cluster.status = Some(crate::crd::EtcdClusterStatus {
            members: vec![MemberStatus {
                extension_client_url: "https://1.2.3.4:2379".into(),
                ..MemberStatus::default()
            }],
            ..Default::default()
        });
        assert_eq!(
            storage_member_endpoints(&cluster),
            vec!["https://1.2.3.4:2379".to_string()]
        );
    }
}
