//! Long-lived request watch per cluster
//!
//! The first probe bootstraps one watch stream over the configured prefix,
//! pre-seeds the key-count gauges from a keys-only range read, and leaves a
//! pair of tasks behind: one pumping watch responses into a bounded channel,
//! one translating events into metrics. Subsequent probes are no-ops while
//! the watch is alive.

use std::sync::Arc;

use etcd_client::{EventType, WatchOptions};
use kube::ResourceExt;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::cluster::storage_member_endpoints;
use crate::crd::{EtcdInspection, annotations};
use crate::etcd::{ClientConfig, EtcdClient};
use crate::metrics::{KeyLabels, Metrics, RequestLabels};

use super::{DEFAULT_INSPECTION_PATH, InspectionError, Result, Server, key_labels};

/// Bounded buffer between the watch stream and the event processor
const EVENT_BUFFER: usize = 40_960;
/// Backoff before re-opening a canceled watch
const WATCH_RESTART_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// The `request` annotation payload
#[derive(Deserialize, Clone, Debug, Default)]
pub struct RequestInfo {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub prefix: bool,
}

/// Owned rendition of a watch event, decoupled from the client types
#[derive(Debug, Clone)]
enum WatchEvent {
    Put { key: String, is_create: bool },
    Delete { key: String },
}

fn process_event(metrics: &Metrics, cluster: &str, event: WatchEvent) {
    match event {
        WatchEvent::Put { key, is_create } => {
            let (etcd_prefix, resource_name) = key_labels(&key);
            // the gauge only moves on creates so re-delivered PUTs cannot
            // double-count a key
            if is_create {
                metrics
                    .key_total
                    .get_or_create(&KeyLabels {
                        cluster: cluster.to_string(),
                        etcd_prefix: etcd_prefix.clone(),
                        resource_name: resource_name.clone(),
                    })
                    .inc();
            }
            metrics
                .request_total
                .get_or_create(&RequestLabels {
                    cluster: cluster.to_string(),
                    grpc_method: "PUT".to_string(),
                    etcd_prefix,
                    resource_name,
                })
                .inc();
        }
        WatchEvent::Delete { key } => {
            let (etcd_prefix, resource_name) = key_labels(&key);
            metrics
                .key_total
                .get_or_create(&KeyLabels {
                    cluster: cluster.to_string(),
                    etcd_prefix: etcd_prefix.clone(),
                    resource_name: resource_name.clone(),
                })
                .dec();
            metrics
                .request_total
                .get_or_create(&RequestLabels {
                    cluster: cluster.to_string(),
                    grpc_method: "Delete".to_string(),
                    etcd_prefix,
                    resource_name,
                })
                .inc();
        }
    }
}

async fn pump_watch(
    client: EtcdClient,
    cluster: String,
    watch_key: String,
    tx: mpsc::Sender<WatchEvent>,
) {
    let mut raw = client.raw();
    loop {
        tracing::debug!(cluster = %cluster, prefix = %watch_key, "starting watch");
        let watch = raw
            .watch(watch_key.as_str(), Some(WatchOptions::new().with_prefix()))
            .await;
        match watch {
            Ok((_watcher, mut stream)) => loop {
                match stream.message().await {
                    Ok(Some(response)) => {
                        if response.canceled() {
                            tracing::warn!(cluster = %cluster, "watch canceled, restarting");
                            break;
                        }
                        for event in response.events() {
                            let Some(kv) = event.kv() else { continue };
                            let Ok(key) = kv.key_str() else { continue };
                            let owned = match event.event_type() {
                                EventType::Put => WatchEvent::Put {
                                    key: key.to_string(),
                                    is_create: kv.create_revision() == kv.mod_revision(),
                                },
                                EventType::Delete => WatchEvent::Delete {
                                    key: key.to_string(),
                                },
                            };
                            if tx.try_send(owned).is_err() {
                                tracing::warn!(
                                    cluster = %cluster,
                                    "event buffer full, dropping watch event"
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(cluster = %cluster, "watch stream ended, restarting");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(cluster = %cluster, "watch stream error: {}", e);
                        break;
                    }
                }
            },
            Err(e) => {
                tracing::warn!(cluster = %cluster, "failed to open watch: {}", e);
            }
        }
        tokio::time::sleep(WATCH_RESTART_DELAY).await;
    }
}

impl Server {
    /// Bootstrap the long-lived watch for a cluster on the first probe
    pub async fn collect_cluster_request(&self, task: &EtcdInspection) -> Result<()> {
        let namespace = task.namespace().unwrap_or_default();
        let (cluster, config) = self
            .cluster_info(&namespace, &task.spec.cluster_name)
            .await?;
        let cluster_name = cluster.name_any();

        if self.watch_active(&cluster_name).await {
            return Ok(());
        }

        let watch_key = cluster
            .annotation(annotations::REQUEST)
            .and_then(|raw| serde_json::from_str::<RequestInfo>(raw).ok())
            .map(|info| info.path)
            .unwrap_or_else(|| DEFAULT_INSPECTION_PATH.to_string());

        let endpoints = storage_member_endpoints(&cluster);
        if endpoints.is_empty() {
            return Err(InspectionError::Config(format!(
                "cluster {} has no member endpoints to watch",
                cluster_name
            )));
        }

        let config = ClientConfig {
            endpoints,
            ..config
        };
        let client = EtcdClient::connect(&config).await?;

        // pre-seed the key-count gauges before any event arrives
        let keys = client.keys(&watch_key).await?;
        for key in &keys {
            let (etcd_prefix, resource_name) = key_labels(key);
            self.metrics()
                .key_total
                .get_or_create(&KeyLabels {
                    cluster: cluster_name.clone(),
                    etcd_prefix,
                    resource_name,
                })
                .inc();
        }
        tracing::info!(
            cluster = %cluster_name,
            prefix = %watch_key,
            keys = keys.len(),
            "request watch bootstrapped"
        );

        let (tx, mut rx) = mpsc::channel::<WatchEvent>(EVENT_BUFFER);

        let metrics: Arc<Metrics> = Arc::clone(self.metrics());
        let processor_cluster = cluster_name.clone();
        let process_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                process_event(&metrics, &processor_cluster, event);
            }
        });

        let watch_task = tokio::spawn(pump_watch(client, cluster_name.clone(), watch_key, tx));

        self.register_watch(&cluster_name, watch_task, process_task)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_info_parses() {
        let info: RequestInfo =
            serde_json::from_str(r#"{"path":"/registry","interval":60,"prefix":true}"#).unwrap();
        assert_eq!(info.path, "/registry");
        assert!(info.prefix);
    }

    #[test]
    fn redelivered_put_bumps_counter_but_not_gauge() {
        let metrics = Metrics::new();
        let put = WatchEvent::Put {
            key: "/registry/pods/nginx".into(),
            is_create: true,
        };
        process_event(&metrics, "demo", put);
        // same ModRevision delivered again: no longer a create
        let replay = WatchEvent::Put {
            key: "/registry/pods/nginx".into(),
            is_create: false,
        };
        process_event(&metrics, "demo", replay);

        let key_labels = KeyLabels {
            cluster: "demo".into(),
            etcd_prefix: "registry".into(),
            resource_name: "pods".into(),
        };
        assert_eq!(metrics.key_total.get_or_create(&key_labels).get(), 1);
        let request_labels = RequestLabels {
            cluster: "demo".into(),
            grpc_method: "PUT".into(),
            etcd_prefix: "registry".into(),
            resource_name: "pods".into(),
        };
        assert_eq!(metrics.request_total.get_or_create(&request_labels).get(), 2);
    }

    #[test]
    fn delete_decrements_key_total() {
        let metrics = Metrics::new();
        process_event(
            &metrics,
            "demo",
            WatchEvent::Put {
                key: "/registry/pods/nginx".into(),
                is_create: true,
            },
        );
        process_event(
            &metrics,
            "demo",
            WatchEvent::Delete {
                key: "/registry/pods/nginx".into(),
            },
        );
        let key_labels = KeyLabels {
            cluster: "demo".into(),
            etcd_prefix: "registry".into(),
            resource_name: "pods".into(),
        };
        assert_eq!(metrics.key_total.get_or_create(&key_labels).get(), 0);
    }
}
