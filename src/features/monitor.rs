//! Scrape-target shaping for Prometheus
//!
//! Materializes a Service (one named port per distinct member endpoint), an
//! Endpoints object for imported clusters whose members live outside the
//! orchestrator, and a ServiceMonitor descriptor. All three land in the
//! monitoring namespace and are deleted when the gate is disabled.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;

use crate::cluster::split_host_port;
use crate::crd::{EtcdCluster, EtcdClusterType, EtcdInspection};
use crate::etcd::{CLIENT_CA_KEY, CLIENT_CERT_KEY, CLIENT_KEY_KEY};
use crate::inspection::InspectionError;

use super::{FeatureName, FeatureProvider, Result, feature_enabled};

/// Default namespace scrape targets are shaped into
const DEFAULT_MONITOR_NAMESPACE: &str = "kstone";
/// Field manager for server-side apply
const FIELD_MANAGER: &str = "kstone-operator";
/// Label joining the scrape objects to their cluster
const ETCD_NAME_LABEL: &str = "etcdName";

pub struct MonitorFeature {
    client: Client,
    namespace: String,
}

impl MonitorFeature {
    pub fn new(client: Client) -> Self {
        let namespace = std::env::var("PROM_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_MONITOR_NAMESPACE.to_string());
        Self { client, namespace }
    }

    fn service_monitor_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "servicemonitors");
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }

    fn labels_for(&self, cluster: &EtcdCluster) -> BTreeMap<String, String> {
        let mut labels = cluster.metadata.labels.clone().unwrap_or_default();
        labels.insert(ETCD_NAME_LABEL.to_string(), cluster.name_any());
        labels
    }

    /// Owner references only work within one namespace
    fn owner_refs(
        &self,
        cluster: &EtcdCluster,
    ) -> Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>> {
        if cluster.namespace().as_deref() == Some(self.namespace.as_str()) {
            cluster.controller_owner_ref(&()).map(|r| vec![r])
        } else {
            None
        }
    }

    /// `host:port` pairs of the members as seen from the control plane
    fn member_addresses(cluster: &EtcdCluster) -> Vec<(String, String)> {
        cluster
            .status
            .as_ref()
            .map(|s| {
                s.members
                    .iter()
                    .filter_map(|m| split_host_port(&m.extension_client_url))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn desired_service(&self, cluster: &EtcdCluster) -> Service {
        let mut ports: Vec<ServicePort> = Vec::new();
        for (host, port) in Self::member_addresses(cluster) {
            let port_name = host.replace('.', "-");
            if ports.last().map(|p| p.name.as_deref()) == Some(Some(port_name.as_str())) {
                continue;
            }
            let target = port.parse::<i32>().unwrap_or(2379);
            ports.push(ServicePort {
                name: Some(port_name),
                protocol: Some("TCP".to_string()),
                port: 2379 + ports.len() as i32,
                target_port: Some(IntOrString::Int(target)),
                ..Default::default()
            });
        }

        let selector = if cluster.spec.cluster_type == EtcdClusterType::KstoneManaged {
            Some(
                [(
                    "etcdcluster.etcd.tkestack.io/cluster-name".to_string(),
                    cluster.name_any(),
                )]
                .into_iter()
                .collect(),
            )
        } else {
            None
        };

        let mut service = Service {
            spec: Some(ServiceSpec {
                ports: Some(ports),
                type_: Some("ClusterIP".to_string()),
                selector,
                ..Default::default()
            }),
            ..Default::default()
        };
        service.metadata.name = Some(cluster.name_any());
        service.metadata.namespace = Some(self.namespace.clone());
        service.metadata.labels = Some(self.labels_for(cluster));
        service.metadata.owner_references = self.owner_refs(cluster);
        service
    }

    /// Imported members live outside the orchestrator, so the scrape Service
    /// needs hand-written Endpoints
    fn desired_endpoints(&self, cluster: &EtcdCluster) -> Endpoints {
        let subsets: Vec<EndpointSubset> = Self::member_addresses(cluster)
            .into_iter()
            .filter_map(|(host, port)| {
                let port = port.parse::<i32>().ok()?;
                Some(EndpointSubset {
                    addresses: Some(vec![EndpointAddress {
                        ip: host.clone(),
                        ..Default::default()
                    }]),
                    ports: Some(vec![EndpointPort {
                        name: Some(host.replace('.', "-")),
                        protocol: Some("TCP".to_string()),
                        port,
                        ..Default::default()
                    }]),
                    ..Default::default()
                })
            })
            .collect();

        let mut endpoints = Endpoints {
            subsets: Some(subsets),
            ..Default::default()
        };
        endpoints.metadata.name = Some(cluster.name_any());
        endpoints.metadata.namespace = Some(self.namespace.clone());
        endpoints.metadata.labels = Some(self.labels_for(cluster));
        endpoints
    }

    fn desired_service_monitor(&self, cluster: &EtcdCluster) -> DynamicObject {
        let service_name = cluster
            .status
            .as_ref()
            .map(|s| s.service_name.clone())
            .unwrap_or_default();
        let scheme = if service_name.starts_with("https") {
            "https"
        } else {
            "http"
        };

        let secret_name = {
            let reference = cluster.tls_secret_ref();
            reference
                .rsplit_once('/')
                .map(|(_, name)| name)
                .unwrap_or(reference)
                .to_string()
        };

        let endpoints: Vec<serde_json::Value> = cluster
            .status
            .as_ref()
            .map(|s| s.members.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|member| {
                let mut endpoint = json!({
                    "port": member.endpoint.replace('.', "-"),
                    "scheme": scheme,
                    "interval": "30s",
                    "relabelings": [
                        {"action": "labelmap", "regex": "__meta_kubernetes_service_label_(.+)"},
                        {
                            "action": "replace",
                            "regex": "(.*)-(.*)-(.*)-(.*)",
                            "replacement": "$1.$2.$3.$4",
                            "sourceLabels": ["endpoint"],
                            "targetLabel": "endpoint"
                        }
                    ]
                });
                if scheme == "https" && !secret_name.is_empty() {
                    endpoint["tlsConfig"] = json!({
                        "ca": {"secret": {"name": secret_name, "key": CLIENT_CA_KEY}},
                        "cert": {"secret": {"name": secret_name, "key": CLIENT_CERT_KEY}},
                        "keySecret": {"name": secret_name, "key": CLIENT_KEY_KEY},
                        "insecureSkipVerify": true
                    });
                }
                endpoint
            })
            .collect();

        let gvk = GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "servicemonitors");
        let mut monitor = DynamicObject::new(&cluster.name_any(), &resource);
        monitor.data = json!({
            "spec": {
                "endpoints": endpoints,
                "namespaceSelector": {"matchNames": [self.namespace]},
                "selector": {"matchLabels": {ETCD_NAME_LABEL: cluster.name_any()}}
            }
        });
        monitor.metadata.namespace = Some(self.namespace.clone());
        monitor.metadata.labels = Some(self.labels_for(cluster));
        monitor.metadata.owner_references = self.owner_refs(cluster);
        monitor
    }

    /// Addresses currently registered on the scrape Endpoints object
    async fn observed_addresses(&self, name: &str) -> Result<Option<Vec<String>>> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(endpoints) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let mut addresses = Vec::new();
        for subset in endpoints.subsets.unwrap_or_default() {
            for address in subset.addresses.unwrap_or_default() {
                for port in subset.ports.clone().unwrap_or_default() {
                    addresses.push(format!("{}:{}", address.ip, port.port));
                }
            }
        }
        addresses.sort();
        Ok(Some(addresses))
    }

    async fn converged_when_enabled(&self, cluster: &EtcdCluster) -> Result<bool> {
        let name = cluster.name_any();

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        if services.get_opt(&name).await?.is_none() {
            return Ok(false);
        }
        if self.service_monitor_api().get_opt(&name).await?.is_none() {
            return Ok(false);
        }

        if cluster.spec.cluster_type == EtcdClusterType::Imported {
            let mut desired: Vec<String> = Self::member_addresses(cluster)
                .into_iter()
                .map(|(host, port)| format!("{}:{}", host, port))
                .collect();
            desired.sort();
            match self.observed_addresses(&name).await? {
                Some(observed) => return Ok(observed == desired),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn converged_when_disabled(&self, cluster: &EtcdCluster) -> Result<bool> {
        let name = cluster.name_any();
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(services.get_opt(&name).await?.is_none()
            && self.service_monitor_api().get_opt(&name).await?.is_none())
    }

    async fn apply(&self, cluster: &EtcdCluster) -> Result<()> {
        let name = cluster.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        services
            .patch(&name, &params, &Patch::Apply(&self.desired_service(cluster)))
            .await?;

        if cluster.spec.cluster_type == EtcdClusterType::Imported {
            let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
            endpoints
                .patch(
                    &name,
                    &params,
                    &Patch::Apply(&self.desired_endpoints(cluster)),
                )
                .await?;
        }

        self.service_monitor_api()
            .patch(
                &name,
                &params,
                &Patch::Apply(&self.desired_service_monitor(cluster)),
            )
            .await?;

        tracing::info!(cluster = %name, namespace = %self.namespace, "synced scrape targets");
        Ok(())
    }

    async fn clean(&self, cluster: &EtcdCluster) -> Result<()> {
        let name = cluster.name_any();
        let ignore_missing = |result: std::result::Result<(), kube::Error>| match result {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(InspectionError::from(e)),
        };

        ignore_missing(
            self.service_monitor_api()
                .delete(&name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_missing(services.delete(&name, &DeleteParams::default()).await.map(|_| ()))?;
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_missing(endpoints.delete(&name, &DeleteParams::default()).await.map(|_| ()))?;

        tracing::info!(cluster = %name, namespace = %self.namespace, "removed scrape targets");
        Ok(())
    }
}

#[async_trait]
impl FeatureProvider for MonitorFeature {
    fn name(&self) -> FeatureName {
        FeatureName::Monitor
    }

    async fn equal(&self, cluster: &EtcdCluster) -> bool {
        let converged = if feature_enabled(cluster, FeatureName::Monitor) {
            if cluster
                .status
                .as_ref()
                .map(|s| s.members.is_empty())
                .unwrap_or(true)
            {
                // nothing to shape yet, wait for members
                return true;
            }
            self.converged_when_enabled(cluster).await
        } else {
            self.converged_when_disabled(cluster).await
        };
        match converged {
            Ok(converged) => converged,
            Err(e) => {
                tracing::warn!("failed to compare scrape targets: {}", e);
                false
            }
        }
    }

    async fn sync(&self, cluster: &EtcdCluster) -> Result<()> {
        if feature_enabled(cluster, FeatureName::Monitor) {
            self.apply(cluster).await
        } else {
            self.clean(cluster).await
        }
    }

    async fn inspect(&self, _task: &EtcdInspection) -> Result<()> {
        Ok(())
    }
}
