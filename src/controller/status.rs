//! Status aggregation and conditions for MongoCluster resources
//!
//! [`aggregate`] folds what one pass observed and did into a single
//! [`MongoClusterStatus`]. [`StatusManager`] publishes it with a merge patch that
//! carries the resourceVersion read at the start of the pass, so a pass computed
//! against a stale read is rejected with 409 instead of overwriting newer status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};

use crate::controller::error::{Error, Result};
use crate::crd::{
    BackupRecord, BackupSummary, ClusterPhase, Condition, CredentialStatus, MongoCluster,
    MongoClusterStatus, PitrStatus, ReplicaSetStatus, RestorePhase, RestoreStatus,
    RolloutPhase, RotationStep, RouterStatus,
};

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// Every replica set and router is serving at the desired topology
    pub const READY: &str = "Ready";
    /// A rollout, restore, backup or rotation is under way
    pub const PROGRESSING: &str = "Progressing";
    /// Members are missing or a replica set has no primary
    pub const DEGRADED: &str = "Degraded";
    pub const CONFIG_VALID: &str = "ConfigurationValid";
    pub const BACKUP_HEALTHY: &str = "BackupHealthy";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
    now: DateTime<Utc>,
}

impl ConditionBuilder {
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            conditions: existing,
            generation,
            now,
        }
    }

    /// Set a condition. The transition time only moves when the status value changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = self.now.to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    fn flag(self, type_: &str, value: bool, reason: &str, message: &str) -> Self {
        let status = if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(type_, status, reason, message)
    }

    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::READY, is_ready, reason, message)
    }

    pub fn progressing(self, is_progressing: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::PROGRESSING, is_progressing, reason, message)
    }

    pub fn degraded(self, is_degraded: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::DEGRADED, is_degraded, reason, message)
    }

    pub fn config_valid(self, is_valid: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::CONFIG_VALID, is_valid, reason, message)
    }

    pub fn backup_healthy(self, is_healthy: bool, reason: &str, message: &str) -> Self {
        self.flag(condition_types::BACKUP_HEALTHY, is_healthy, reason, message)
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// What one pass observed and did, ready to be folded into status
#[derive(Default)]
pub struct StatusInputs<'a> {
    pub previous: Option<&'a MongoClusterStatus>,
    pub generation: Option<i64>,
    pub replica_sets: BTreeMap<String, ReplicaSetStatus>,
    pub routers: Option<RouterStatus>,
    /// Shards not yet registered with the routers
    pub unregistered_shards: Vec<String>,
    pub backups: Vec<BackupRecord>,
    pub backup_summary: Option<BackupSummary>,
    pub pitr: Option<PitrStatus>,
    pub restore: Option<RestoreStatus>,
    /// The spec still asks for the restore in `restore`
    pub restore_requested: bool,
    pub credentials: BTreeMap<String, CredentialStatus>,
    /// Backup agent failures of this pass; they degrade backups, not the cluster
    pub backup_errors: Vec<String>,
    pub pass_error: Option<&'a Error>,
    pub stopping: bool,
    pub now: DateTime<Utc>,
}

impl<'a> StatusInputs<'a> {
    /// Inputs that repeat the previous status, for passes that observed nothing new
    pub fn carried_over(previous: Option<&'a MongoClusterStatus>, generation: Option<i64>, now: DateTime<Utc>) -> Self {
        let Some(p) = previous else {
            return Self {
                generation,
                now,
                ..Default::default()
            };
        };
        Self {
            previous,
            generation,
            replica_sets: p.replica_sets.clone(),
            routers: p.routers.clone(),
            unregistered_shards: Vec::new(),
            backups: p.backups.clone(),
            backup_summary: p.backup_summary.clone(),
            pitr: p.pitr.clone(),
            restore: p.restore.clone(),
            restore_requested: false,
            credentials: p.credentials.clone(),
            backup_errors: Vec::new(),
            pass_error: None,
            stopping: false,
            now,
        }
    }
}

fn set_serving(rs: &ReplicaSetStatus) -> bool {
    rs.rollout.phase == RolloutPhase::Stable && rs.initialized && rs.primary.is_some() && rs.ready >= rs.size
}

fn restore_in_progress(restore: Option<&RestoreStatus>) -> bool {
    restore.is_some_and(|r| !r.phase.is_terminal())
}

/// The sub-state in Error, if any, with its cause
fn error_cause(inputs: &StatusInputs<'_>) -> Option<(String, &'static str)> {
    if let Some(err) = inputs.pass_error.filter(|e| !e.is_retryable()) {
        return Some((err.to_string(), err.reason()));
    }
    for (name, rs) in &inputs.replica_sets {
        if rs.rollout.phase == RolloutPhase::Error {
            let message = rs.rollout.message.as_deref().unwrap_or("rollout failed");
            return Some((format!("replica set {}: {}", name, message), "RolloutFailed"));
        }
    }
    if let Some(routers) = &inputs.routers
        && routers.rollout.phase == RolloutPhase::Error
    {
        let message = routers.rollout.message.as_deref().unwrap_or("rollout failed");
        return Some((format!("routers: {}", message), "RolloutFailed"));
    }
    if inputs.restore_requested
        && let Some(restore) = inputs.restore.as_ref().filter(|r| r.phase == RestorePhase::Failed)
    {
        let message = restore.error.as_deref().unwrap_or("restore failed");
        return Some((format!("restore {}: {}", restore.name, message), "RestoreFailed"));
    }
    None
}

/// Fold a pass into the cluster status
pub fn aggregate(inputs: StatusInputs<'_>) -> MongoClusterStatus {
    let previous = inputs.previous;
    let error = error_cause(&inputs);

    let all_serving = !inputs.replica_sets.is_empty() && inputs.replica_sets.values().all(set_serving);
    let routers_serving = inputs
        .routers
        .as_ref()
        .is_none_or(|r| r.rollout.phase == RolloutPhase::Stable && r.ready >= r.size);
    let rotating = inputs.credentials.values().any(|c| c.step != RotationStep::Idle);
    let restoring = restore_in_progress(inputs.restore.as_ref());

    let phase = if inputs.stopping || previous.is_some_and(|p| p.phase == ClusterPhase::Stopping) {
        ClusterPhase::Stopping
    } else if error.is_some() {
        ClusterPhase::Error
    } else if all_serving && routers_serving && inputs.unregistered_shards.is_empty() && !rotating && !restoring {
        ClusterPhase::Ready
    } else {
        ClusterPhase::Initializing
    };

    let (last_error, reason) = match (&error, inputs.pass_error) {
        (Some((message, reason)), _) => (Some(message.clone()), *reason),
        (None, Some(err)) => (Some(err.to_string()), err.reason()),
        (None, None) => (None, "Healthy"),
    };
    let last_error_time = match (&last_error, previous) {
        (None, _) => None,
        (Some(message), Some(p)) if p.last_error.as_ref() == Some(message) => p.last_error_time.clone(),
        (Some(_), _) => Some(inputs.now.to_rfc3339()),
    };
    let retry_count = if inputs.pass_error.is_some() {
        Some(previous.and_then(|p| p.retry_count).unwrap_or(0) + 1)
    } else {
        Some(0)
    };
    let phase_started_at = match previous {
        Some(p) if p.phase == phase && p.phase_started_at.is_some() => p.phase_started_at.clone(),
        _ => Some(inputs.now.to_rfc3339()),
    };

    let degraded_sets: Vec<&str> = inputs
        .replica_sets
        .iter()
        .filter(|(_, rs)| rs.initialized && (rs.primary.is_none() || rs.ready < rs.size))
        .map(|(name, _)| name.as_str())
        .collect();
    let progressing: Vec<String> = inputs
        .replica_sets
        .iter()
        .filter(|(_, rs)| !matches!(rs.rollout.phase, RolloutPhase::Stable | RolloutPhase::Error))
        .map(|(name, rs)| format!("{} {}", name, rs.rollout.phase))
        .chain(
            inputs
                .routers
                .iter()
                .filter(|r| !matches!(r.rollout.phase, RolloutPhase::Stable | RolloutPhase::Error))
                .map(|r| format!("routers {}", r.rollout.phase)),
        )
        .chain(restoring.then(|| match inputs.restore.as_ref().and_then(|r| r.message.as_deref()) {
            Some(waiting) => format!("restore in progress: {}", waiting),
            None => "restore in progress".to_string(),
        }))
        .chain(rotating.then(|| "credential rotation in progress".to_string()))
        .chain(
            inputs
                .backup_summary
                .as_ref()
                .filter(|s| s.in_progress > 0)
                .map(|_| "backup in progress".to_string()),
        )
        .collect();
    let validation_failed = matches!(inputs.pass_error, Some(Error::ValidationError(_)));
    let backup_problem = inputs
        .backup_errors
        .first()
        .cloned()
        .or_else(|| inputs.pitr.as_ref().and_then(|p| p.error.clone()));

    let existing = previous.map(|p| p.conditions.clone()).unwrap_or_default();
    let mut builder = ConditionBuilder::from_existing(existing, inputs.generation, inputs.now);
    builder = match phase {
        ClusterPhase::Ready => builder.ready(true, "ClusterReady", "All members are serving"),
        ClusterPhase::Stopping => builder.ready(false, "Stopping", "Cluster is being deleted"),
        ClusterPhase::Error => builder.ready(false, reason, last_error.as_deref().unwrap_or("")),
        ClusterPhase::Initializing => builder.ready(false, "Initializing", "Cluster is converging"),
    };
    builder = if progressing.is_empty() {
        builder.progressing(false, "Stable", "No changes in progress")
    } else {
        builder.progressing(true, "Reconciling", &progressing.join(", "))
    };
    builder = if phase == ClusterPhase::Error {
        builder.degraded(true, reason, last_error.as_deref().unwrap_or(""))
    } else if !degraded_sets.is_empty() {
        builder.degraded(
            true,
            "MembersUnavailable",
            &format!("replica sets below desired readiness: {}", degraded_sets.join(", ")),
        )
    } else {
        builder.degraded(false, "Healthy", "All initialized replica sets have a primary")
    };
    builder = match inputs.pass_error {
        Some(err) if validation_failed => builder.config_valid(false, "ValidationFailed", &err.to_string()),
        _ => builder.config_valid(true, "Valid", "Spec passed semantic validation"),
    };
    builder = match &backup_problem {
        Some(message) => builder.backup_healthy(false, "AgentFailed", message),
        None => builder.backup_healthy(true, "NoErrors", "Backup agents report no errors"),
    };

    MongoClusterStatus {
        phase,
        replica_sets: inputs.replica_sets,
        routers: inputs.routers,
        backups: inputs.backups,
        backup_summary: inputs.backup_summary,
        pitr: inputs.pitr,
        restore: inputs.restore,
        credentials: inputs.credentials,
        last_error,
        last_error_time,
        retry_count,
        observed_generation: inputs.generation,
        phase_started_at,
        conditions: builder.build(),
    }
}

/// JSON merge patch turning `old` into `new`: keys missing from `new` become null
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in new {
                let entry = match old.get(key) {
                    Some(previous) => merge_patch(previous, value),
                    None => value.clone(),
                };
                patch.insert(key.clone(), entry);
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Publishes status for one MongoCluster
pub struct StatusManager<'a> {
    cluster: &'a MongoCluster,
    client: Client,
}

impl<'a> StatusManager<'a> {
    pub fn new(cluster: &'a MongoCluster, client: Client) -> Self {
        Self { cluster, client }
    }

    /// Conditionally replace the status. Fails with 409 when the object changed since it was read.
    pub async fn write(&self, status: &MongoClusterStatus) -> Result<()> {
        if self.cluster.status.as_ref() == Some(status) {
            return Ok(());
        }
        let namespace = self.cluster.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
        let api: Api<MongoCluster> = Api::namespaced(self.client.clone(), &namespace);

        let old = serde_json::to_value(self.cluster.status.clone().unwrap_or_default())?;
        let new = serde_json::to_value(status)?;
        let mut patch = serde_json::json!({ "status": merge_patch(&old, &new) });
        if let Some(version) = self.cluster.resource_version() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": version });
        }

        api.patch_status(&self.cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
