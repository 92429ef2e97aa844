//! Pluggable feature providers, keyed by feature name
//!
//! A feature provider owns one operational feature of a cluster: it can tell
//! whether the external state already matches the gate-implied desired state
//! (`equal`), converge it (`sync`), and execute one probe iteration for its
//! inspection record (`inspect`).

mod backup;
mod inspections;
mod monitor;

pub use backup::BackupFeature;
pub use inspections::InspectionFeature;
pub use monitor::MonitorFeature;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::crd::{EtcdCluster, EtcdInspection, annotations};
use crate::inspection::InspectionError;

pub type Result<T, E = InspectionError> = std::result::Result<T, E>;

/// The closed set of recognized feature names
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeatureName {
    Monitor,
    Backup,
    Healthy,
    Request,
    Consistency,
    Alarm,
    BackupCheck,
}

impl FeatureName {
    pub const ALL: [FeatureName; 7] = [
        FeatureName::Monitor,
        FeatureName::Backup,
        FeatureName::Healthy,
        FeatureName::Request,
        FeatureName::Consistency,
        FeatureName::Alarm,
        FeatureName::BackupCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::Monitor => "monitor",
            FeatureName::Backup => "backup",
            FeatureName::Healthy => "healthy",
            FeatureName::Request => "request",
            FeatureName::Consistency => "consistency",
            FeatureName::Alarm => "alarm",
            FeatureName::BackupCheck => "backupcheck",
        }
    }

    pub fn parse(name: &str) -> Option<FeatureName> {
        FeatureName::ALL.iter().copied().find(|f| f.as_str() == name)
    }
}

impl std::fmt::Display for FeatureName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status strings written into `feature_gates_status`
pub const FEATURE_STATUS_DONE: &str = "done";
pub const FEATURE_STATUS_DISABLED: &str = "disabled";

/// Whether a feature gate expression enables a name. Malformed tokens are
/// ignored; an absent name counts as disabled.
pub fn gate_enabled(expression: &str, name: FeatureName) -> bool {
    for token in expression.split(',') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        if key == name.as_str() {
            if let Ok(enabled) = value.parse::<bool>() {
                if enabled {
                    return true;
                }
            }
        }
    }
    false
}

/// Whether a cluster's `featureGates` annotation enables a feature
pub fn feature_enabled(cluster: &EtcdCluster, name: FeatureName) -> bool {
    cluster
        .annotation(annotations::FEATURE_GATES)
        .map(|gates| gate_enabled(gates, name))
        .unwrap_or(false)
}

/// One feature's Equal/Sync/Do contract
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    fn name(&self) -> FeatureName;

    /// True when the external state already matches the gate-implied desired
    /// state; for a disabled gate this means the external resource is absent
    async fn equal(&self, cluster: &EtcdCluster) -> bool;

    /// Make the world match: create-or-update when enabled, delete/teardown
    /// when disabled. Must be idempotent.
    async fn sync(&self, cluster: &EtcdCluster) -> Result<()>;

    /// Execute one probe iteration for this feature's inspection record
    async fn inspect(&self, task: &EtcdInspection) -> Result<()>;
}

/// Explicit provider registry handed to the controllers at construction.
/// Iteration order is the stable feature-name order.
#[derive(Default)]
pub struct FeatureRegistry {
    providers: BTreeMap<FeatureName, Arc<dyn FeatureProvider>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; first registration wins
    pub fn register(&mut self, provider: Arc<dyn FeatureProvider>) {
        let name = provider.name();
        if self.providers.contains_key(&name) {
            tracing::warn!(%name, "feature provider registered twice, keeping the first");
            return;
        }
        tracing::debug!(%name, "registered feature provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: FeatureName) -> Option<Arc<dyn FeatureProvider>> {
        self.providers.get(&name).cloned()
    }

    /// Resolve a provider from an inspection record's type string
    pub fn get_by_inspection_type(&self, inspection_type: &str) -> Option<Arc<dyn FeatureProvider>> {
        FeatureName::parse(inspection_type).and_then(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureName, &Arc<dyn FeatureProvider>)> {
        self.providers.iter().map(|(name, p)| (*name, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_parse_and_ignore_malformed_tokens() {
        assert!(gate_enabled("monitor=true", FeatureName::Monitor));
        assert!(gate_enabled("healthy=true,monitor=false", FeatureName::Healthy));
        assert!(!gate_enabled("monitor=false", FeatureName::Monitor));
        assert!(!gate_enabled("", FeatureName::Monitor));
        // malformed tokens are skipped, valid ones still honored
        assert!(gate_enabled("garbage,monitor=true,also=bad=token", FeatureName::Monitor));
        assert!(!gate_enabled("monitor", FeatureName::Monitor));
        assert!(!gate_enabled("monitor=yes", FeatureName::Monitor));
        // absence of a name means disabled
        assert!(!gate_enabled("backup=true", FeatureName::Monitor));
    }

    #[test]
    fn feature_names_round_trip() {
        for name in FeatureName::ALL {
            assert_eq!(FeatureName::parse(name.as_str()), Some(name));
        }
        assert_eq!(FeatureName::parse("unknown"), None);
    }
}
