//! Reconciliation logic for EtcdCluster resources
//!
//! Each reconcile selects the next lifecycle action from the condition
//! history, dispatches it through the cluster provider, probes the observed
//! status, projects feature gates into labels and fans out to the feature
//! providers. Conditions follow the append-only tail algebra: the live
//! condition per action type is the tail, an in-progress action is `False`,
//! and only a completed (`True`) tail may be replaced.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::ClusterProvider;
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{
    ClusterCondition, ClusterConditionType, ConditionStatus, EtcdCluster, EtcdClusterPhase,
};
use crate::etcd::load_client_config;
use crate::features::{FEATURE_STATUS_DISABLED, FEATURE_STATUS_DONE, FeatureName, feature_enabled};

/// How often Running clusters are re-probed
const STATUS_REFRESH: Duration = Duration::from_secs(30);

/// The next lifecycle action derived from the condition history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextAction {
    Creating,
    Updating,
    /// Probe and report status; also selected when `equal` cannot decide
    Status,
}

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    debug!("Reconciling EtcdCluster");

    // never mutate the cached object
    let mut cluster = (*cluster).clone();

    let provider = ctx.cluster_providers.get(cluster.spec.cluster_type)?;

    let action = desired_action(&cluster, provider.as_ref()).await;
    let outcome = match action {
        NextAction::Creating => handle_create(&mut cluster, provider.as_ref()).await,
        NextAction::Updating => handle_update(&mut cluster, provider.as_ref()).await,
        NextAction::Status => handle_status(&mut cluster, provider.as_ref(), &ctx, &ns).await,
    };

    write_status(&ctx, &ns, &name, &cluster).await?;

    if let Err(e) = outcome {
        error!("lifecycle dispatch failed: {}", e);
        ctx.publish_warning_event(
            &cluster,
            &format!("{:?}", action),
            "Reconcile",
            Some(e.to_string()),
        )
        .await;
        return Err(e);
    }

    let phase = cluster
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or_default();
    if phase != EtcdClusterPhase::Running {
        debug!(%phase, "cluster not running, skipping feature fan-out");
        return Ok(Action::requeue(STATUS_REFRESH));
    }

    sync_labels(&ctx, &ns, &mut cluster).await?;
    sync_features(&ctx, &mut cluster).await;
    write_status(&ctx, &ns, &name, &cluster).await?;

    Ok(Action::requeue(STATUS_REFRESH))
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<EtcdCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);

    if error.is_retryable() {
        warn!("Retryable error for {}: {}, requeuing in {:?}", name, error, delay);
    } else {
        error!(
            "Non-retryable error for {}: {}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Select the next lifecycle action from the condition history.
///
/// An empty history means the cluster was never created; an in-progress
/// (`False`) Create or Update tail is resumed; otherwise the provider's
/// `equal` decides between Updating and a plain status probe. When `equal`
/// itself errors the probe path is taken so an unknown comparison cannot
/// churn the cluster through Updating.
async fn desired_action(cluster: &EtcdCluster, provider: &dyn ClusterProvider) -> NextAction {
    let conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    let Some(last) = conditions.last() else {
        return NextAction::Creating;
    };

    match (last.type_, last.status) {
        (ClusterConditionType::Create, ConditionStatus::False) => return NextAction::Creating,
        (ClusterConditionType::Update, ConditionStatus::False) => return NextAction::Updating,
        _ => {}
    }

    match provider.equal(cluster).await {
        Ok(true) => NextAction::Status,
        Ok(false) => {
            info!(cluster = %cluster.name_any(), "spec drifted, updating");
            NextAction::Updating
        }
        Err(e) => {
            warn!(cluster = %cluster.name_any(), "equality check failed: {}", e);
            NextAction::Status
        }
    }
}

/// Append a fresh in-progress condition for the next action. The history is
/// never rewritten in place: a completed tail of the same type is popped and
/// replaced, an in-progress tail is kept as-is.
fn generate_conditions(
    mut conditions: Vec<ClusterCondition>,
    next: ClusterConditionType,
) -> Vec<ClusterCondition> {
    if let Some(last) = conditions.last() {
        if last.status != ConditionStatus::True {
            return conditions;
        }
        if last.type_ == next {
            conditions.pop();
        }
    }

    conditions.push(ClusterCondition {
        type_: next,
        status: ConditionStatus::False,
        start_time: Utc::now().to_rfc3339(),
        end_time: String::new(),
        reason: String::new(),
        message: String::new(),
    });
    conditions
}

/// Run the Before/Do/After hooks for one lifecycle action
async fn dispatch_trio(
    provider: &dyn ClusterProvider,
    cluster: &EtcdCluster,
    condition_type: ClusterConditionType,
) -> crate::cluster::Result<()> {
    match condition_type {
        ClusterConditionType::Update => {
            provider.before_update(cluster).await?;
            provider.update(cluster).await?;
            provider.after_update(cluster).await?;
        }
        _ => {
            provider.before_create(cluster).await?;
            provider.create(cluster).await?;
            provider.after_create(cluster).await?;
        }
    }
    Ok(())
}

async fn run_lifecycle_trio(
    cluster: &mut EtcdCluster,
    provider: &dyn ClusterProvider,
    condition_type: ClusterConditionType,
    phase: EtcdClusterPhase,
) -> Result<()> {
    let status = cluster.status.get_or_insert_with(Default::default);
    status.conditions = generate_conditions(std::mem::take(&mut status.conditions), condition_type);
    status.phase = phase;
    let index = status.conditions.len() - 1;

    let snapshot = cluster.clone();
    if let Err(e) = dispatch_trio(provider, &snapshot, condition_type).await {
        error!(action = ?condition_type, "lifecycle step failed: {}", e);
        if let Some(status) = cluster.status.as_mut() {
            status.conditions[index].reason = e.to_string();
        }
        return Err(e.into());
    }

    if let Some(status) = cluster.status.as_mut() {
        let condition = &mut status.conditions[index];
        condition.reason.clear();
        condition.end_time = Utc::now().to_rfc3339();
        condition.status = ConditionStatus::True;
    }
    Ok(())
}

async fn handle_create(cluster: &mut EtcdCluster, provider: &dyn ClusterProvider) -> Result<()> {
    run_lifecycle_trio(
        cluster,
        provider,
        ClusterConditionType::Create,
        EtcdClusterPhase::Creating,
    )
    .await
}

async fn handle_update(cluster: &mut EtcdCluster, provider: &dyn ClusterProvider) -> Result<()> {
    run_lifecycle_trio(
        cluster,
        provider,
        ClusterConditionType::Update,
        EtcdClusterPhase::Updating,
    )
    .await
}

/// Resolve TLS material and ask the provider for the observed status
async fn handle_status(
    cluster: &mut EtcdCluster,
    provider: &dyn ClusterProvider,
    ctx: &Context,
    ns: &str,
) -> Result<()> {
    let config = load_client_config(&ctx.client, ns, cluster.tls_secret_ref()).await?;

    match provider.status(&config, cluster).await {
        Ok(status) => {
            cluster.status = Some(status);
            Ok(())
        }
        Err(e) => {
            ctx.publish_warning_event(
                cluster,
                "UpdateStatus",
                "Reconcile",
                Some(format!("failed to get cluster status: {}", e)),
            )
            .await;
            Err(e.into())
        }
    }
}

/// Project the feature gates plus clusterType/version into labels; only
/// patch metadata when the computed set differs from the current one.
async fn sync_labels(ctx: &Context, ns: &str, cluster: &mut EtcdCluster) -> Result<()> {
    let mut labels = cluster.metadata.labels.clone().unwrap_or_default();
    for name in FeatureName::ALL {
        labels.insert(
            name.as_str().to_string(),
            feature_enabled(cluster, name).to_string(),
        );
    }
    labels.insert(
        "clusterType".to_string(),
        cluster.spec.cluster_type.to_string(),
    );
    labels.insert("version".to_string(), cluster.spec.version.clone());

    if cluster.metadata.labels.as_ref() == Some(&labels) {
        return Ok(());
    }

    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), ns);
    let patch = serde_json::json!({"metadata": {"labels": labels}});
    api.patch(
        &cluster.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    cluster.metadata.labels = Some(labels);
    Ok(())
}

/// Fan out to every registered feature provider. A provider failure is
/// recorded in `feature_gates_status` and never blocks the other features.
async fn sync_features(ctx: &Context, cluster: &mut EtcdCluster) {
    let snapshot = cluster.clone();
    let status = cluster.status.get_or_insert_with(Default::default);

    for (name, provider) in ctx.features.iter() {
        let enabled = feature_enabled(&snapshot, name);

        if provider.equal(&snapshot).await {
            let converged = if enabled {
                FEATURE_STATUS_DONE
            } else {
                FEATURE_STATUS_DISABLED
            };
            status
                .feature_gates_status
                .insert(name.as_str().to_string(), converged.to_string());
            continue;
        }

        match provider.sync(&snapshot).await {
            Ok(()) => {
                let outcome = if enabled {
                    FEATURE_STATUS_DONE
                } else {
                    FEATURE_STATUS_DISABLED
                };
                status
                    .feature_gates_status
                    .insert(name.as_str().to_string(), outcome.to_string());
            }
            Err(e) => {
                warn!(feature = %name, "feature sync failed: {}", e);
                status.feature_gates_status.insert(
                    name.as_str().to_string(),
                    format!("failed to enable {}: {}", name, e),
                );
            }
        }
    }
}

/// Write the status subresource back
async fn write_status(ctx: &Context, ns: &str, name: &str, cluster: &EtcdCluster) -> Result<()> {
    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), ns);
    let patch = serde_json::json!({"status": cluster.status});
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(type_: ClusterConditionType, status: ConditionStatus) -> ClusterCondition {
        ClusterCondition {
            type_,
            status,
            start_time: String::new(),
            end_time: String::new(),
            reason: String::new(),
            message: String::new(),
        }
    }

    #[test]
    fn empty_history_appends_in_progress_condition() {
        let conditions = generate_conditions(vec![], ClusterConditionType::Create);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, ClusterConditionType::Create);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert!(!conditions[0].start_time.is_empty());
    }

    #[test]
    fn in_progress_tail_is_kept() {
        let history = vec![condition(ClusterConditionType::Create, ConditionStatus::False)];
        let conditions = generate_conditions(history.clone(), ClusterConditionType::Create);
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].start_time.is_empty());
    }

    #[test]
    fn completed_tail_of_same_type_is_replaced() {
        let history = vec![condition(ClusterConditionType::Update, ConditionStatus::True)];
        let conditions = generate_conditions(history, ClusterConditionType::Update);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn completed_tail_of_other_type_is_preserved() {
        let history = vec![condition(ClusterConditionType::Create, ConditionStatus::True)];
        let conditions = generate_conditions(history, ClusterConditionType::Update);
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, ClusterConditionType::Create);
        assert_eq!(conditions[1].type_, ClusterConditionType::Update);
        assert_eq!(conditions[1].status, ConditionStatus::False);
    }
}
