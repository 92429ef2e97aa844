pub mod backup;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod etcd;
pub mod features;
pub mod health;
pub mod inspection;
pub mod metrics;

pub use controller::{Context, Error, Result};
pub use crd::{EtcdCluster, EtcdInspection};

use std::sync::Arc;

use futures::StreamExt;
use kube::Api;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;

/// Run the EtcdCluster controller
///
/// Watches EtcdCluster resources in every namespace and reconciles them
/// through the context's provider registries. Blocks until the watch stream
/// ends; callers spawn it as a task.
pub async fn run_cluster_controller(ctx: Arc<Context>) {
    tracing::info!("Starting controller for EtcdCluster resources");

    let clusters: Api<EtcdCluster> = Api::all(ctx.client.clone());
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config)
        .run(
            controller::cluster_reconciler::reconcile,
            controller::cluster_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Reconciliation error: {:?}", e);
                }
            }
        })
        .await;

    tracing::error!("EtcdCluster controller stream ended unexpectedly");
}

/// Run the EtcdInspection controller
///
/// Watches inspection records and executes their probes through the feature
/// providers.
pub async fn run_inspection_controller(ctx: Arc<Context>) {
    tracing::info!("Starting controller for EtcdInspection resources");

    let inspections: Api<EtcdInspection> = Api::all(ctx.client.clone());
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(inspections, watcher_config)
        .run(
            controller::inspection_reconciler::reconcile,
            controller::inspection_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Inspected: {}", obj.name);
                }
                Err(e) => {
                    tracing::error!("Inspection error: {:?}", e);
                }
            }
        })
        .await;

    tracing::error!("EtcdInspection controller stream ended unexpectedly");
}
