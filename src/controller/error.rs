//! Error types for the MongoCluster controller

use std::time::Duration;

use thiserror::Error;

use crate::resources::admin::AdminError;
use crate::resources::agent::AgentClientError;
use crate::resources::platform::PlatformError;
use crate::resources::secret::StoreError;

/// Error variants are named with the `Error` suffix for clarity (e.g., `KubeError`, `ValidationError`).
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    PlatformError(#[from] PlatformError),

    #[error("Database admin error: {0}")]
    AdminError(#[from] AdminError),

    #[error("Backup agent error: {0}")]
    AgentError(#[from] AgentClientError),

    #[error("Credential store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Semantic invariant violation in the desired spec. Never retried.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Platform, network or timeout failure. Retried with backoff.
    #[error("Transient error (will retry): {0}")]
    TransientError(String),

    /// An action would drop a replica set below quorum. Needs operator intervention.
    #[error("Quorum risk: {0}")]
    QuorumRiskError(String),

    /// Deletion was observed mid-pass; no new mutations were issued.
    #[error("Reconcile pass cancelled: {0}")]
    Cancelled(String),

    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: i32, last_error: String },
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::PlatformError(e) => e.is_retryable(),
            Error::AdminError(_) => true,
            Error::AgentError(e) => e.is_retryable(),
            Error::StoreError(_) => true,
            Error::TransientError(_) => true,
            Error::Cancelled(_) => true,
            Error::FinalizerError(_) => true,
            Error::ValidationError(_) => false,
            Error::QuorumRiskError(_) => false,
            Error::SerializationError(_) => false,
            Error::MissingObjectKey(_) => false,
            Error::RetryBudgetExhausted { .. } => false,
        }
    }

    /// Check if this error means the object is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(api_err)) => api_err.code == 404,
            Error::PlatformError(PlatformError::Kube(kube::Error::Api(api_err))) => {
                api_err.code == 404
            }
            _ => false,
        }
    }

    /// Check if this error is a compare-and-swap conflict on the status write
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(api_err)) if api_err.code == 409)
    }

    /// Short machine-readable reason used in conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::ValidationError(_) => "ValidationFailed",
            Error::QuorumRiskError(_) => "QuorumRisk",
            Error::AgentError(_) => "AgentFailed",
            Error::Cancelled(_) => "Cancelled",
            Error::RetryBudgetExhausted { .. } => "RetryBudgetExhausted",
            Error::KubeError(_) | Error::PlatformError(_) => "PlatformUnavailable",
            Error::AdminError(_) => "DatabaseUnavailable",
            Error::StoreError(_) => "CredentialStoreUnavailable",
            _ => "ReconciliationFailed",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
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
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for a spec change; poll slowly meanwhile
            self.max_delay
        }
    }
}

/// Run a collaborator call with a deadline. An elapsed deadline is a transient error
/// naming `what`.
pub async fn bounded<F, T, E>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Error::TransientError(format!("{} timed out after {:?}", what, limit))),
    }
}
