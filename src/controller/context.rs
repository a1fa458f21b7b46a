use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::Client;
use tokio::sync::{Mutex as PassMutex, OwnedMutexGuard};

use crate::controller::error::BackoffConfig;
use crate::controller::validation::parse_interval;
use crate::health::HealthState;
use crate::resources::common::ClusterKey;
use crate::resources::{
    BackupAgent, CredentialStore, DatabaseAdmin, KubePlatform, MongoshAdmin, PbmAgent, Platform,
    SecretStore,
};

/// The outbound collaborators a reconcile pass talks to
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn Platform>,
    pub admin: Arc<dyn DatabaseAdmin>,
    pub agent: Arc<dyn BackupAgent>,
    pub store: Arc<dyn CredentialStore>,
}

impl Collaborators {
    /// Kubernetes-backed implementations of every collaborator
    pub fn kube(client: Client) -> Self {
        Self {
            platform: Arc::new(KubePlatform::new(client.clone())),
            admin: Arc::new(MongoshAdmin::new(client.clone())),
            agent: Arc::new(PbmAgent::new(client.clone())),
            store: Arc::new(SecretStore::new(client)),
        }
    }
}

/// Operator-wide tunables
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Deadline of one health query
    pub health_timeout: Duration,
    /// Deadline of one platform, agent or credential store call
    pub call_timeout: Duration,
    /// Passes a rollout action may spend in verification before the rollout errors
    pub max_verify_passes: u32,
    /// Consecutive failed passes before a transient error is surfaced as terminal
    pub retry_budget: i32,
    /// Requeue interval while anything is in progress
    pub requeue_active: Duration,
    /// Requeue interval of a Ready cluster
    pub requeue_idle: Duration,
    pub backoff: BackoffConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_verify_passes: 60,
            retry_budget: 10,
            requeue_active: Duration::from_secs(10),
            requeue_idle: Duration::from_secs(300),
            backoff: BackoffConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Read overrides from `MONGODB_OPERATOR_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from a variable lookup; unset or unparsable values keep the default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let duration = |name: &str| {
            lookup(name)
                .and_then(|v| parse_interval(&v))
                .and_then(|d| d.to_std().ok())
        };

        if let Some(d) = duration("MONGODB_OPERATOR_HEALTH_TIMEOUT") {
            config.health_timeout = d;
        }
        if let Some(d) = duration("MONGODB_OPERATOR_CALL_TIMEOUT") {
            config.call_timeout = d;
        }
        if let Some(d) = duration("MONGODB_OPERATOR_REQUEUE_ACTIVE") {
            config.requeue_active = d;
        }
        if let Some(d) = duration("MONGODB_OPERATOR_REQUEUE_IDLE") {
            config.requeue_idle = d;
        }
        if let Some(n) = lookup("MONGODB_OPERATOR_MAX_VERIFY_PASSES").and_then(|v| v.parse().ok()) {
            config.max_verify_passes = n;
        }
        if let Some(n) = lookup("MONGODB_OPERATOR_RETRY_BUDGET").and_then(|v| v.parse().ok()) {
            config.retry_budget = n;
        }
        config
    }
}

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub collaborators: Collaborators,
    pub config: OperatorConfig,
    /// Health state for metrics (optional)
    pub health_state: Option<Arc<HealthState>>,
    passes: Mutex<HashMap<ClusterKey, Arc<PassMutex<()>>>>,
}

impl Context {
    pub fn new(client: Client, health_state: Option<Arc<HealthState>>) -> Self {
        let collaborators = Collaborators::kube(client.clone());
        Self::with_collaborators(client, collaborators, OperatorConfig::from_env(), health_state)
    }

    pub fn with_collaborators(
        client: Client,
        collaborators: Collaborators,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            collaborators,
            config,
            health_state,
            passes: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize passes per cluster identity. Passes of different clusters never contend.
    pub async fn pass_lock(&self, key: &ClusterKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut passes = self.passes.lock().unwrap_or_else(|e| e.into_inner());
            passes.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a cluster that has been finalized
    pub fn forget(&self, key: &ClusterKey) {
        let mut passes = self.passes.lock().unwrap_or_else(|e| e.into_inner());
        passes.remove(key);
    }
}
