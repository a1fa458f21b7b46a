//! Restore orchestration
//!
//! ```text
//! RestoreRequested -> Preparing -> Restoring -> Verifying -> Ready
//!        |               |            |             |
//!        +---------------+------------+-------------+--> Failed
//! ```
//!
//! The source is chosen before anything is touched: a point-in-time restore needs
//! the latest Completed full backup at or before the target plus an unbroken run of
//! PITR chunks from that backup up to the target. A missing base or a gap fails the
//! restore without a single agent call.
//!
//! While Preparing, Restoring and Verifying the data sets are isolated: rollouts
//! are paused and the continuous capture is stopped. A restore that failed after
//! overwriting data keeps the isolation until the restore is withdrawn or replaced.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::controller::backup::{destination, latest_base};
use crate::controller::error::{Error, bounded};
use crate::controller::validation::parse_timestamp;
use crate::crd::{
    BackupRecord, BackupSpec, BackupState, BackupType, RestorePhase, RestoreSpec, RestoreStatus,
};
use crate::resources::agent::{AgentClientError, AgentPhase, BackupAgent};
use crate::resources::common::ClusterKey;

/// Why no restore source could be chosen
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("no base backup available on storage {storage} before the requested target")]
    NoBaseBackup { storage: String },

    #[error("gap detected: no point-in-time increment covers {from} to {until}")]
    Gap { from: String, until: String },

    #[error("backup {0} is not a completed backup on the requested storage")]
    BackupNotFound(String),

    #[error("invalid point-in-time target {0:?}")]
    InvalidTarget(String),
}

/// Base backup and increments a restore replays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSource {
    pub base: String,
    /// PITR chunk records replayed on top of the base, oldest first
    pub chunks: Vec<String>,
    pub until: Option<DateTime<Utc>>,
}

fn parse(value: &Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_timestamp)
}

/// Pick the backup (and increments) a restore request resolves to
pub fn select_restore_source(spec: &RestoreSpec, records: &[BackupRecord]) -> Result<RestoreSource, SourceError> {
    if let Some(target) = &spec.pitr_target {
        let target = parse_timestamp(target).ok_or_else(|| SourceError::InvalidTarget(target.clone()))?;
        let (base, base_time) = latest_base(records, &spec.storage_name, Some(target)).ok_or_else(|| {
            SourceError::NoBaseBackup {
                storage: spec.storage_name.clone(),
            }
        })?;

        let mut chunks: Vec<(DateTime<Utc>, DateTime<Utc>, &str)> = records
            .iter()
            .filter(|r| {
                r.backup_type == BackupType::PitrChunk
                    && r.state == BackupState::Completed
                    && r.storage_name == spec.storage_name
            })
            .filter_map(|r| Some((parse(&r.chunk_start)?, parse(&r.last_write_at)?, r.name.as_str())))
            .collect();
        chunks.sort();

        let mut cursor = base_time;
        let mut replay = Vec::new();
        for (start, end, name) in chunks {
            if cursor >= target {
                break;
            }
            if end <= cursor {
                continue;
            }
            if start > cursor {
                return Err(SourceError::Gap {
                    from: cursor.to_rfc3339(),
                    until: start.to_rfc3339(),
                });
            }
            replay.push(name.to_string());
            cursor = end;
        }
        if cursor < target {
            return Err(SourceError::Gap {
                from: cursor.to_rfc3339(),
                until: target.to_rfc3339(),
            });
        }

        return Ok(RestoreSource {
            base: base.name.clone(),
            chunks: replay,
            until: Some(target),
        });
    }

    if let Some(name) = &spec.backup_name {
        let found = records.iter().any(|r| {
            r.name == *name
                && r.state == BackupState::Completed
                && r.backup_type != BackupType::PitrChunk
                && r.storage_name == spec.storage_name
        });
        if !found {
            return Err(SourceError::BackupNotFound(name.clone()));
        }
        return Ok(RestoreSource {
            base: name.clone(),
            chunks: Vec::new(),
            until: None,
        });
    }

    latest_base(records, &spec.storage_name, None)
        .map(|(base, _)| RestoreSource {
            base: base.name.clone(),
            chunks: Vec::new(),
            until: None,
        })
        .ok_or_else(|| SourceError::NoBaseBackup {
            storage: spec.storage_name.clone(),
        })
}

/// Everything a restore pass looks at
pub struct RestoreInputs<'a> {
    pub key: &'a ClusterKey,
    pub spec: Option<&'a RestoreSpec>,
    pub backup: Option<&'a BackupSpec>,
    pub records: &'a [BackupRecord],
    /// No data set has a rollout mid-mutation and no backup is running
    pub quiesced: bool,
    /// The continuous capture is not running
    pub pitr_stopped: bool,
    /// Members able to run the restore agent, preferred first
    pub candidates: &'a [String],
    /// Every data set has a primary and a healthy majority
    pub data_sets_ready: bool,
    pub now: DateTime<Utc>,
    pub timeout: Duration,
    pub max_verify_passes: u32,
}

/// Result of a restore pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreOutcome {
    pub status: Option<RestoreStatus>,
    /// Data sets must stay isolated from rollouts and backups
    pub isolate: bool,
    pub agent_error: Option<String>,
}

/// Whether a restore in this phase keeps the data sets isolated
pub fn isolates(status: &RestoreStatus) -> bool {
    match status.phase {
        RestorePhase::Preparing | RestorePhase::Restoring | RestorePhase::Verifying => true,
        RestorePhase::Failed => status.data_touched,
        RestorePhase::RestoreRequested | RestorePhase::Ready => false,
    }
}

fn fail(status: &mut RestoreStatus, message: String, now: DateTime<Utc>) {
    warn!(restore = %status.name, error = %message, "Restore failed");
    status.phase = RestorePhase::Failed;
    status.error = Some(message);
    status.finished_at = Some(now.to_rfc3339());
}

/// Advance the restore by one step
pub async fn reconcile_restore(
    agent: &dyn BackupAgent,
    inputs: &RestoreInputs<'_>,
    current: Option<RestoreStatus>,
) -> RestoreOutcome {
    let Some(spec) = inputs.spec else {
        // Withdrawn: lift the isolation and keep the record as history
        let status = current.map(|mut s| {
            if !s.phase.is_terminal() {
                fail(&mut s, "restore withdrawn before completion".to_string(), inputs.now);
            }
            s
        });
        return RestoreOutcome {
            status,
            ..Default::default()
        };
    };

    let mut status = match current.filter(|s| s.name == spec.name) {
        Some(status) => status,
        None => {
            info!(cluster = %inputs.key, restore = %spec.name, "Restore requested");
            RestoreStatus {
                name: spec.name.clone(),
                phase: RestorePhase::RestoreRequested,
                started_at: Some(inputs.now.to_rfc3339()),
                ..Default::default()
            }
        }
    };
    let mut agent_error = None;

    match status.phase {
        RestorePhase::RestoreRequested => match select_restore_source(spec, inputs.records) {
            Ok(source) => {
                info!(restore = %spec.name, base = %source.base, chunks = source.chunks.len(), "Restore source selected");
                status.base_backup = Some(source.base);
                status.chunks = source.chunks;
                status.phase = RestorePhase::Preparing;
                status.stalled_passes = 0;
            }
            Err(e) => fail(&mut status, e.to_string(), inputs.now),
        },
        RestorePhase::Preparing => {
            agent_error = prepare(agent, inputs, spec, &mut status).await;
        }
        RestorePhase::Restoring => {
            agent_error = poll(agent, inputs, &mut status).await;
        }
        RestorePhase::Verifying => {
            if inputs.data_sets_ready {
                info!(cluster = %inputs.key, restore = %status.name, "Restore verified");
                status.phase = RestorePhase::Ready;
                status.finished_at = Some(inputs.now.to_rfc3339());
                status.error = None;
                status.message = None;
            } else {
                stall(
                    &mut status,
                    "data sets did not regain a healthy primary after the restore",
                    inputs.max_verify_passes,
                    inputs.now,
                );
            }
        }
        RestorePhase::Ready | RestorePhase::Failed => {}
    }

    RestoreOutcome {
        isolate: isolates(&status),
        status: Some(status),
        agent_error,
    }
}

/// Count a pass the restore could not progress; fails it past the bound
fn stall(status: &mut RestoreStatus, reason: &str, max_passes: u32, now: DateTime<Utc>) {
    status.stalled_passes += 1;
    status.message = Some(reason.to_string());
    if status.stalled_passes > max_passes {
        fail(status, format!("{} after {} passes", reason, max_passes), now);
    }
}

async fn prepare(
    agent: &dyn BackupAgent,
    inputs: &RestoreInputs<'_>,
    spec: &RestoreSpec,
    status: &mut RestoreStatus,
) -> Option<String> {
    if !inputs.quiesced || !inputs.pitr_stopped {
        stall(status, "cluster did not quiesce for the restore", inputs.max_verify_passes, inputs.now);
        return None;
    }
    let Some(member) = inputs.candidates.first() else {
        stall(
            status,
            "no healthy member to run the restore agent",
            inputs.max_verify_passes,
            inputs.now,
        );
        return None;
    };
    let Some(destination) = inputs.backup.and_then(|b| destination(b, &spec.storage_name)) else {
        fail(status, format!("backup storage {} is not configured", spec.storage_name), inputs.now);
        return None;
    };
    let Some(base) = status.base_backup.clone() else {
        fail(status, "restore has no base backup".to_string(), inputs.now);
        return None;
    };
    let until = spec.pitr_target.as_deref().and_then(parse_timestamp);

    let result = bounded(
        inputs.timeout,
        "restore start",
        agent.restore(inputs.key, member, &destination, &base, until),
    )
    .await;
    match result {
        Ok(operation) => {
            info!(cluster = %inputs.key, restore = %status.name, member = %member, "Restore started");
            status.member = Some(member.clone());
            status.operation = Some(operation);
            status.data_touched = true;
            status.stalled_passes = 0;
            status.message = None;
            status.phase = RestorePhase::Restoring;
            None
        }
        Err(Error::AgentError(e @ AgentClientError::Rejected { .. })) => {
            fail(status, e.to_string(), inputs.now);
            Some(e.to_string())
        }
        Err(e) => Some(e.to_string()),
    }
}

async fn poll(agent: &dyn BackupAgent, inputs: &RestoreInputs<'_>, status: &mut RestoreStatus) -> Option<String> {
    let (Some(member), Some(operation)) = (status.member.clone(), status.operation.clone()) else {
        fail(status, "restore operation was lost".to_string(), inputs.now);
        return None;
    };
    match bounded(inputs.timeout, "restore status", agent.status(inputs.key, &member, &operation)).await {
        Ok(report) => match report.phase {
            AgentPhase::Pending | AgentPhase::Running => None,
            AgentPhase::Succeeded => {
                info!(cluster = %inputs.key, restore = %status.name, "Restore data applied, verifying");
                status.phase = RestorePhase::Verifying;
                status.stalled_passes = 0;
                None
            }
            AgentPhase::Failed(message) => {
                fail(status, message.clone(), inputs.now);
                Some(message)
            }
        },
        Err(Error::AgentError(e @ AgentClientError::Rejected { .. })) => {
            fail(status, e.to_string(), inputs.now);
            Some(e.to_string())
        }
        Err(e) => Some(e.to_string()),
    }
}
