//! Error types for the EtcdCluster and EtcdInspection controllers

use std::time::Duration;

use thiserror::Error;

use crate::backup::BackupError;
use crate::cluster::ProviderError;
use crate::etcd::EtcdError;
use crate::inspection::InspectionError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Etcd(#[from] EtcdError),

    #[error(transparent)]
    Inspection(#[from] InspectionError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Whether requeueing with backoff can make progress. Configuration
    /// errors stay until the object changes, so retrying them is noise.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::Provider(ProviderError::Config(_)) => false,
            Error::Provider(ProviderError::UnknownProvider(_)) => false,
            Error::Provider(_) => true,
            Error::Etcd(EtcdError::Config(_)) => false,
            Error::Etcd(_) => true,
            Error::Inspection(e) => !e.is_configuration(),
            Error::Backup(BackupError::Config(_)) => false,
            Error::Backup(BackupError::UnknownStorage(_)) => false,
            Error::Backup(_) => true,
            Error::InvalidConfig(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration for the error policies
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given retry attempt, jittered
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(delay_with_jitter.min(self.max_delay.as_secs_f64()))
    }

    /// Non-retryable errors wait out the max delay so a changed object or
    /// operator intervention can resolve them
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            self.max_delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_do_not_retry() {
        assert!(!Error::InvalidConfig("bad".into()).is_retryable());
        assert!(!Error::Etcd(EtcdError::Config("bad".into())).is_retryable());
        assert!(!Error::Provider(ProviderError::Config("bad".into())).is_retryable());
        assert!(Error::Etcd(EtcdError::Network("timeout".into())).is_retryable());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            jitter: 0.0,
            ..Default::default()
        };
        let first = backoff.delay_for_attempt(0);
        let second = backoff.delay_for_attempt(1);
        assert!(second > first);
        assert!(backoff.delay_for_attempt(20) <= backoff.max_delay);
    }
}
