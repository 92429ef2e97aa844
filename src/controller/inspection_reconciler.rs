//! Reconciliation logic for EtcdInspection resources
//!
//! Each record is routed to its feature provider by inspection type and the
//! probe runs at most once per scheduled wake: a reconcile triggered by our
//! own status write lands inside the interval window and only re-schedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, instrument, warn};

use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{EtcdInspection, InspectionRecord};
use crate::inspection::DEFAULT_INSPECTION_INTERVAL;

/// Bounded probe-outcome history kept on the status
const MAX_RECORDS: usize = 10;

fn probe_interval(task: &EtcdInspection) -> Duration {
    let seconds = if task.spec.interval_in_second == 0 {
        DEFAULT_INSPECTION_INTERVAL
    } else {
        task.spec.interval_in_second
    };
    Duration::from_secs(seconds)
}

/// Time left until the next scheduled probe, if the last one is recent
fn remaining_window(task: &EtcdInspection, interval: Duration) -> Option<Duration> {
    let last = task.status.as_ref()?.last_updated_time.as_str();
    let last = DateTime::parse_from_rfc3339(last).ok()?;
    let elapsed = Utc::now().signed_duration_since(last).to_std().ok()?;
    interval.checked_sub(elapsed)
}

/// Main reconciliation function
#[instrument(skip(task, ctx), fields(name = %task.name_any(), namespace = task.namespace().unwrap_or_default()))]
pub async fn reconcile(task: Arc<EtcdInspection>, ctx: Arc<Context>) -> Result<Action> {
    let inspection_type = task.spec.inspection_type.clone();
    let interval = probe_interval(&task);

    let Some(provider) = ctx.features.get_by_inspection_type(&inspection_type) else {
        warn!(%inspection_type, "no feature provider for inspection type");
        return Ok(Action::await_change());
    };

    if let Some(remaining) = remaining_window(&task, interval) {
        debug!(?remaining, "probe window not yet open");
        return Ok(Action::requeue(remaining));
    }

    let started = Utc::now();
    let outcome = provider.inspect(&task).await;
    let finished = Utc::now();

    let record = match &outcome {
        Ok(()) => InspectionRecord {
            start_time: started.to_rfc3339(),
            end_time: finished.to_rfc3339(),
            reason: String::new(),
            message: String::new(),
        },
        Err(e) => InspectionRecord {
            start_time: started.to_rfc3339(),
            end_time: finished.to_rfc3339(),
            reason: "ProbeFailed".to_string(),
            message: e.to_string(),
        },
    };
    if let Err(e) = append_record(&ctx, &task, record).await {
        warn!("failed to record inspection outcome: {}", e);
    }

    match outcome {
        Ok(()) => {
            debug!(%inspection_type, "probe completed");
            Ok(Action::requeue(interval))
        }
        Err(e) => {
            ctx.health_state
                .metrics
                .record_inspection_failure(&task.spec.cluster_name, &inspection_type);
            if e.is_configuration() {
                // retrying cannot help until the object changes
                error!(%inspection_type, "probe misconfigured: {}", e);
                Ok(Action::requeue(interval))
            } else {
                Err(Error::Inspection(e))
            }
        }
    }
}

/// Error policy for the inspection controller
pub fn error_policy(task: Arc<EtcdInspection>, error: &Error, _ctx: Arc<Context>) -> Action {
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);
    warn!(
        "Inspection {} failed: {}, requeuing in {:?}",
        task.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}

async fn append_record(
    ctx: &Context,
    task: &EtcdInspection,
    record: InspectionRecord,
) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let api: Api<EtcdInspection> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = task.status.clone().unwrap_or_default();
    status.reason = record.reason.clone();
    status.message = record.message.clone();
    status.last_updated_time = record.end_time.clone();
    status.records.push(record);
    if status.records.len() > MAX_RECORDS {
        let drop = status.records.len() - MAX_RECORDS;
        status.records.drain(..drop);
    }

    let patch = serde_json::json!({"status": status});
    api.patch_status(
        &task.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdInspectionSpec, EtcdInspectionStatus};

    fn task(interval: u64, last_updated: Option<String>) -> EtcdInspection {
        let mut task = EtcdInspection::new(
            "demo-healthy",
            EtcdInspectionSpec {
                cluster_name: "demo".into(),
                inspection_type: "healthy".into(),
                inspection_provider: String::new(),
                interval_in_second: interval,
            },
        );
        if let Some(last_updated_time) = last_updated {
            task.status = Some(EtcdInspectionStatus {
                last_updated_time,
                ..Default::default()
            });
        }
        task
    }

    #[test]
    fn interval_defaults_to_five_minutes() {
        assert_eq!(probe_interval(&task(0, None)), Duration::from_secs(300));
        assert_eq!(probe_interval(&task(60, None)), Duration::from_secs(60));
    }

    #[test]
    fn window_open_without_history() {
        let task = task(60, None);
        assert!(remaining_window(&task, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn window_closed_right_after_a_probe() {
        let task = task(300, Some(Utc::now().to_rfc3339()));
        let remaining = remaining_window(&task, Duration::from_secs(300)).unwrap();
        assert!(remaining > Duration::from_secs(290));
    }

    #[test]
    fn window_open_after_the_interval_passed() {
        let stale = (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();
        let task = task(300, Some(stale));
        assert!(remaining_window(&task, Duration::from_secs(300)).is_none());
    }
}
