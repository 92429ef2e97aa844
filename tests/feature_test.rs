//! Cross-module behavior tests that need no live cluster

use std::collections::BTreeMap;
use std::sync::Arc;

use kstone_operator::cluster::{ClusterProvider, ImportedClusterProvider};
use kstone_operator::crd::{
    AuthConfig, EtcdCluster, EtcdClusterPhase, EtcdClusterSpec, EtcdClusterStatus, EtcdClusterType,
    MemberStatus, annotations,
};
use kstone_operator::etcd::{ClientConfig, ClientPool};
use kstone_operator::features::{FeatureName, feature_enabled};
use kstone_operator::metrics::{AlarmLabels, EndpointLabels, Metrics};

fn cluster(annotations_map: &[(&str, &str)]) -> EtcdCluster {
    let mut cluster = EtcdCluster::new(
        "demo",
        EtcdClusterSpec {
            name: "demo".into(),
            description: String::new(),
            cluster_type: EtcdClusterType::Imported,
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
            auth_config: AuthConfig::default(),
        },
    );
    cluster.metadata.namespace = Some("default".into());
    if !annotations_map.is_empty() {
        cluster.metadata.annotations = Some(
            annotations_map
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    cluster
}

#[test]
fn feature_gate_projection_matches_the_expression() {
    let cluster = cluster(&[(
        annotations::FEATURE_GATES,
        "monitor=true,healthy=false,consistency=true,garbage",
    )]);

    let projected: BTreeMap<&str, bool> = FeatureName::ALL
        .iter()
        .map(|name| (name.as_str(), feature_enabled(&cluster, *name)))
        .collect();

    assert!(projected["monitor"]);
    assert!(projected["consistency"]);
    assert!(!projected["healthy"]);
    assert!(!projected["backup"]);
    assert!(!projected["request"]);
}

#[tokio::test]
async fn imported_cluster_without_members_or_address_is_unknown() {
    let provider = ImportedClusterProvider::new(Arc::new(ClientPool::new()));
    let cluster = cluster(&[]);

    let status = provider
        .status(&ClientConfig::default(), &cluster)
        .await
        .unwrap();
    assert_eq!(status.phase, EtcdClusterPhase::Unknown);
    assert!(status.members.is_empty());
    // no endpoints, so no service name either
    assert!(status.service_name.is_empty());
}

#[tokio::test]
async fn imported_address_becomes_the_service_name_even_when_unreachable() {
    let provider = ImportedClusterProvider::new(Arc::new(ClientPool::new()));
    // nothing listens on port 1, the dial fails fast
    let cluster = cluster(&[(annotations::IMPORTED_ADDR, "http://127.0.0.1:1")]);

    let status = provider
        .status(&ClientConfig::default(), &cluster)
        .await
        .unwrap();
    assert_eq!(status.phase, EtcdClusterPhase::Unknown);
    assert_eq!(status.service_name, "http://127.0.0.1:1");
}

#[tokio::test]
async fn member_endpoints_take_precedence_over_the_imported_address() {
    let provider = ImportedClusterProvider::new(Arc::new(ClientPool::new()));
    let mut cluster = cluster(&[(annotations::IMPORTED_ADDR, "http://10.0.0.5:2379")]);
    cluster.status = Some(EtcdClusterStatus {
        service_name: "http://10.0.0.9:2379".into(),
        members: vec![MemberStatus {
            extension_client_url: "http://127.0.0.1:1".into(),
            ..MemberStatus::default()
        }],
        ..Default::default()
    });

    let status = provider
        .status(&ClientConfig::default(), &cluster)
        .await
        .unwrap();
    // the probe used the member endpoint, so the fallback never rewrote the
    // service name
    assert_eq!(status.service_name, "http://10.0.0.9:2379");
}

#[test]
fn alarm_gauges_reset_across_every_known_kind() {
    let metrics = Metrics::new();
    let kinds = ["NOSPACE", "CORRUPT"];

    // one NOSPACE alarm fires
    metrics
        .endpoint_alarm
        .get_or_create(&AlarmLabels {
            cluster: "demo".into(),
            endpoint: "10.0.0.5".into(),
            alarm_kind: "NOSPACE".into(),
        })
        .set(1);

    // an empty alarm list resets both kinds for the endpoint
    for kind in kinds {
        metrics
            .endpoint_alarm
            .get_or_create(&AlarmLabels {
                cluster: "demo".into(),
                endpoint: "10.0.0.5".into(),
                alarm_kind: kind.into(),
            })
            .set(0);
    }

    let encoded = metrics.encode();
    for kind in kinds {
        let needle = format!("alarmKind=\"{}\"", kind);
        let line = encoded
            .lines()
            .find(|l| l.contains("etcd_endpoint_alarm") && l.contains(&needle))
            .unwrap();
        assert!(line.trim_end().ends_with(" 0"), "line was {:?}", line);
    }
}

#[test]
fn healthy_gauge_is_zero_or_one_per_endpoint() {
    let metrics = Metrics::new();
    let labels = EndpointLabels {
        cluster: "demo".into(),
        endpoint: "10.0.0.5".into(),
    };
    metrics.endpoint_healthy.get_or_create(&labels).set(1);
    assert_eq!(metrics.endpoint_healthy.get_or_create(&labels).get(), 1);
    metrics.endpoint_healthy.get_or_create(&labels).set(0);
    assert_eq!(metrics.endpoint_healthy.get_or_create(&labels).get(), 0);
}

#[test]
fn cluster_round_trips_through_json_with_legacy_spellings() {
    let raw = serde_json::json!({
        "apiVersion": "etcd.tkestack.io/v1alpha2",
        "kind": "EtcdCluster",
        "metadata": {"name": "legacy", "namespace": "default"},
        "spec": {
            "name": "legacy",
            "clusterType": "kstone-etcd-operator",
            "size": 3,
            "version": "3.4.13"
        },
        "status": {
            "phase": "UnHealthy",
            "members": [{
                "name": "m1",
                "memberId": "1",
                "status": "UnKnown",
                "endpoint": "10.0.0.5",
                "port": "2379",
                "clientUrl": "http://10.0.0.5:2379",
                "extensionClientUrl": "http://10.0.0.5:2379",
                "role": "UnKnown"
            }]
        }
    });

    let cluster: EtcdCluster = serde_json::from_value(raw).unwrap();
    assert_eq!(cluster.spec.cluster_type, EtcdClusterType::KstoneManaged);
    let status = cluster.status.as_ref().unwrap();
    assert_eq!(status.phase, EtcdClusterPhase::Unhealthy);

    // normalized spellings on egress
    let serialized = serde_json::to_value(&cluster).unwrap();
    assert_eq!(serialized["status"]["phase"], "Unhealthy");
    assert_eq!(serialized["status"]["members"][0]["status"], "Unknown");
    assert_eq!(serialized["spec"]["clusterType"], "kstone-managed");
}
