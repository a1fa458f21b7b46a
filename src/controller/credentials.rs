//! Credential rotation
//!
//! Every managed user walks the same persisted sequence, one step per pass:
//!
//! ```text
//! Idle -> PendingStored -> Applied -> Stored -> Revoked -> [Restarting] -> Idle
//! ```
//!
//! The new secret is durably stored as pending before the database ever sees it,
//! and promoted to active only after every target accepted it. An engine that
//! keeps a single credential per user invalidates the old password the moment it
//! accepts the new one, so there the promotion follows in the same step and is
//! retried first on resume. Each step is
//! idempotent given the step before it, so a pass interrupted anywhere resumes from
//! the last persisted step without losing the credential the database holds.
//! Any failure leaves the step where it is.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result, bounded};
use crate::crd::{CredentialPolicy, CredentialStatus, DatabaseUser, RotationStep};
use crate::resources::admin::DatabaseAdmin;
use crate::resources::common::ClusterKey;
use crate::resources::secret::{CredentialStore, PASSWORD_LENGTH, generate_password};

/// Everything a rotation pass looks at
pub struct RotationInputs<'a> {
    pub key: &'a ClusterKey,
    pub policy: Option<&'a CredentialPolicy>,
    /// Members users are written through: a healthy router, or each data set primary
    pub targets: &'a [String],
    /// Data sets without a usable target; nothing is applied while any is listed
    pub missing_targets: &'a [String],
    /// Pods caching credentials in memory
    pub cache_pods: &'a [String],
    /// Restarts requested by an earlier pass are still outstanding
    pub restarts_pending: bool,
    pub timeout: Duration,
}

/// Result of a rotation pass
#[derive(Debug, Default)]
pub struct RotationOutcome {
    pub statuses: BTreeMap<String, CredentialStatus>,
    /// Pods to restart so they pick up a rotated credential
    pub restarts: Vec<String>,
    pub errors: Vec<Error>,
}

impl RotationOutcome {
    pub fn in_progress(&self) -> bool {
        self.statuses.values().any(|s| s.step != RotationStep::Idle)
    }
}

/// Advance every managed user by at most one step
pub async fn rotate_credentials(
    admin: &dyn DatabaseAdmin,
    store: &dyn CredentialStore,
    inputs: &RotationInputs<'_>,
    current: &BTreeMap<String, CredentialStatus>,
) -> RotationOutcome {
    let mut outcome = RotationOutcome::default();
    let Some(policy) = inputs.policy else {
        return outcome;
    };

    for user in &policy.users {
        let mut status = current.get(&user.name).cloned();
        let result = advance(admin, store, inputs, policy, user, &mut status, &mut outcome.restarts).await;
        let Some(mut status) = status else {
            // The stored credential could not be read yet; nothing to record
            if let Err(e) = result {
                warn!(cluster = %inputs.key, user = %user.name, error = %e, "Reading stored credential failed");
                outcome.errors.push(e);
            }
            continue;
        };
        if let Err(e) = result {
            warn!(cluster = %inputs.key, user = %user.name, step = %status.step, error = %e, "Credential rotation step failed");
            status.message = Some(format!("{} step failed: {}", status.step, e));
            outcome.errors.push(e);
        }
        outcome.statuses.insert(user.name.clone(), status);
    }
    outcome
}

async fn advance(
    admin: &dyn DatabaseAdmin,
    store: &dyn CredentialStore,
    inputs: &RotationInputs<'_>,
    policy: &CredentialPolicy,
    user: &DatabaseUser,
    status: &mut Option<CredentialStatus>,
    restarts: &mut Vec<String>,
) -> Result<()> {
    let key = inputs.key;
    let secret = policy.secret_name.as_str();
    let timeout = inputs.timeout;

    if status.is_none() {
        // No record yet: adopt a credential that is already fully in place, otherwise
        // start below any generation so the first rotation creates the user
        let stored = bounded(timeout, "credential read", store.read(key, secret, &user.name)).await?;
        let generation = match stored.generation {
            Some(g) if stored.password.is_some() && stored.pending.is_none() && g >= user.generation => g,
            _ => -1,
        };
        *status = Some(CredentialStatus {
            generation,
            ..Default::default()
        });
        return Ok(());
    }
    let Some(status) = status.as_mut() else {
        return Ok(());
    };

    match status.step {
        RotationStep::Idle => {
            if user.generation <= status.generation {
                status.target_generation = None;
                return Ok(());
            }
            if !inputs.missing_targets.is_empty() {
                status.message = Some(format!("waiting for a primary on {}", inputs.missing_targets.join(", ")));
                return Ok(());
            }
            let target = user.generation;
            let stored = bounded(timeout, "credential read", store.read(key, secret, &user.name)).await?;
            if stored.pending.as_ref().is_none_or(|p| p.generation != target) {
                let password = generate_password(PASSWORD_LENGTH);
                bounded(
                    timeout,
                    "credential write",
                    store.write_pending(key, secret, &user.name, target, &password),
                )
                .await?;
                let confirmed = bounded(timeout, "credential read", store.read(key, secret, &user.name)).await?;
                if confirmed.pending.as_ref().is_none_or(|p| p.generation != target) {
                    return Err(Error::TransientError(format!(
                        "pending credential of {} not visible after write",
                        user.name
                    )));
                }
            }
            info!(cluster = %key, user = %user.name, generation = target, "Pending credential stored");
            status.target_generation = Some(target);
            status.step = RotationStep::PendingStored;
            status.message = None;
        }
        RotationStep::PendingStored => {
            let Some(target) = status.target_generation else {
                status.step = RotationStep::Idle;
                return Ok(());
            };
            if !inputs.missing_targets.is_empty() || inputs.targets.is_empty() {
                status.message = Some("waiting for a member to apply the credential to".to_string());
                return Ok(());
            }
            let stored = bounded(timeout, "credential read", store.read(key, secret, &user.name)).await?;
            let Some(pending) = stored.pending.filter(|p| p.generation == target) else {
                if stored.generation == Some(target) {
                    status.step = RotationStep::Stored;
                } else {
                    warn!(cluster = %key, user = %user.name, "Pending credential vanished before it was applied");
                    status.step = RotationStep::Idle;
                    status.target_generation = None;
                }
                return Ok(());
            };
            for target_pod in inputs.targets {
                bounded(
                    timeout,
                    "user upsert",
                    admin.upsert_user(key, target_pod, &user.name, &pending.password),
                )
                .await?;
            }
            info!(cluster = %key, user = %user.name, generation = target, "Credential applied to the database");
            status.step = RotationStep::Applied;
            status.message = None;
            if !admin.supports_dual_credentials() {
                promote(store, inputs, secret, &user.name, target).await?;
                status.step = RotationStep::Stored;
            }
        }
        RotationStep::Applied => {
            let target = status.target_generation.unwrap_or(user.generation);
            promote(store, inputs, secret, &user.name, target).await?;
            status.step = RotationStep::Stored;
            status.message = None;
        }
        RotationStep::Stored => {
            if admin.supports_dual_credentials() {
                for target_pod in inputs.targets {
                    bounded(
                        timeout,
                        "credential revoke",
                        admin.revoke_previous_credential(key, target_pod, &user.name),
                    )
                    .await?;
                }
            } else {
                debug!(user = %user.name, "Single-credential engine, nothing to revoke");
            }
            status.step = RotationStep::Revoked;
            status.message = None;
        }
        RotationStep::Revoked => {
            if user.cached_in_memory && !inputs.cache_pods.is_empty() {
                info!(cluster = %key, user = %user.name, pods = inputs.cache_pods.len(), "Restarting members caching the credential");
                restarts.extend(inputs.cache_pods.iter().cloned());
                status.step = RotationStep::Restarting;
            } else {
                finish(status, key, user);
            }
        }
        RotationStep::Restarting => {
            if !inputs.restarts_pending {
                finish(status, key, user);
            }
        }
    }

    Ok(())
}

/// Make generation `target` the active credential and confirm it by reading back
async fn promote(
    store: &dyn CredentialStore,
    inputs: &RotationInputs<'_>,
    secret: &str,
    user: &str,
    target: i64,
) -> Result<()> {
    let (key, timeout) = (inputs.key, inputs.timeout);
    bounded(timeout, "credential promote", store.promote(key, secret, user, target)).await?;
    let confirmed = bounded(timeout, "credential read", store.read(key, secret, user)).await?;
    if confirmed.generation != Some(target) {
        return Err(Error::TransientError(format!(
            "credential generation {} of {} not active after promote",
            target, user
        )));
    }
    debug!(user, generation = target, "Credential promoted");
    Ok(())
}

fn finish(status: &mut CredentialStatus, key: &ClusterKey, user: &DatabaseUser) {
    let generation = status.target_generation.take().unwrap_or(user.generation);
    info!(cluster = %key, user = %user.name, generation, "Credential rotation complete");
    status.generation = generation;
    status.step = RotationStep::Idle;
    status.message = None;
}
