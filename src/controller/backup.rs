//! Backup orchestration
//!
//! Each backup record moves through `Requested -> Starting -> Running ->
//! Completed | Failed`, driven by the backup agent on one Healthy member. At most
//! one backup runs at a time and none starts while a restore is active.
//!
//! The orchestrator also keeps the continuous PITR capture running once a base
//! backup exists, turns the chunks it closes into catalog records, and prunes
//! completed backups beyond each task's retention.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::controller::error::{Error, bounded};
use crate::controller::validation::{parse_interval, parse_timestamp};
use crate::crd::{
    BackupRecord, BackupSpec, BackupState, BackupSummary, BackupType, PitrStatus,
};
use crate::resources::agent::{
    AgentClientError, AgentMode, AgentPhase, AgentStatus, BackupAgent, Destination,
};
use crate::resources::common::ClusterKey;

/// Everything a backup pass looks at
pub struct BackupInputs<'a> {
    pub key: &'a ClusterKey,
    pub spec: &'a BackupSpec,
    /// Healthy members able to run the agent, preferred first
    pub candidates: &'a [String],
    /// A restore is preparing, running or verifying
    pub restore_active: bool,
    pub now: DateTime<Utc>,
    pub timeout: Duration,
}

/// Result of a backup pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackupOutcome {
    pub records: Vec<BackupRecord>,
    pub pitr: Option<PitrStatus>,
    pub summary: BackupSummary,
    /// Agent failures recorded this pass; they never fail the pass
    pub agent_errors: Vec<String>,
}

/// Destination descriptor of a named storage
pub fn destination(spec: &BackupSpec, storage_name: &str) -> Option<Destination> {
    spec.storages.get(storage_name).map(|storage| Destination {
        name: storage_name.to_string(),
        storage: storage.clone(),
    })
}

fn agent_mode(backup_type: BackupType) -> AgentMode {
    match backup_type {
        BackupType::Full => AgentMode::Full,
        BackupType::Incremental => AgentMode::Incremental,
        BackupType::PitrChunk => AgentMode::Pitr,
    }
}

/// The agent refused the call; retrying the same request cannot succeed
fn is_rejected(error: &Error) -> bool {
    matches!(error, Error::AgentError(AgentClientError::Rejected { .. }))
}

fn timestamp(record_time: &Option<String>) -> Option<DateTime<Utc>> {
    record_time.as_deref().and_then(parse_timestamp)
}

/// Record a backup request. Requests are identified by name: asking again for a
/// name already in the catalog returns the existing record, whatever its state.
pub fn request_backup<'r>(
    records: &'r mut Vec<BackupRecord>,
    name: &str,
    storage_name: &str,
    backup_type: BackupType,
    task: Option<&str>,
    now: DateTime<Utc>,
) -> &'r BackupRecord {
    let index = match records.iter().position(|r| r.name == name) {
        Some(index) => index,
        None => {
            debug!(backup = name, storage = storage_name, "Backup requested");
            records.push(BackupRecord {
                name: name.to_string(),
                storage_name: storage_name.to_string(),
                backup_type,
                state: BackupState::Requested,
                task: task.map(str::to_string),
                member: None,
                operation: None,
                requested_at: Some(now.to_rfc3339()),
                started_at: None,
                completed_at: None,
                last_write_at: None,
                chunk_start: None,
                error: None,
            });
            records.len() - 1
        }
    };
    &records[index]
}

/// Scheduled tasks whose interval has elapsed, with the name of the backup to request
pub fn due_tasks(spec: &BackupSpec, records: &[BackupRecord], now: DateTime<Utc>) -> Vec<(String, usize)> {
    spec.tasks
        .iter()
        .enumerate()
        .filter_map(|(index, task)| {
            let interval = parse_interval(&task.schedule)?;
            let last = records
                .iter()
                .filter(|r| r.task.as_deref() == Some(task.name.as_str()))
                .filter_map(|r| timestamp(&r.requested_at))
                .max();
            let due = last.is_none_or(|last| last + interval <= now);
            due.then(|| (format!("{}-{}", task.name, now.format("%Y%m%d%H%M")), index))
        })
        .collect()
}

/// Fold the catalog into the summary the status exposes
pub fn summarize(records: &[BackupRecord]) -> BackupSummary {
    let count = |state: BackupState| records.iter().filter(|r| r.state == state).count() as i32;
    let last_completed = records
        .iter()
        .filter(|r| r.state == BackupState::Completed && r.backup_type != BackupType::PitrChunk)
        .max_by_key(|r| timestamp(&r.completed_at));
    let last_failure = records
        .iter()
        .filter(|r| r.state == BackupState::Failed)
        .max_by_key(|r| timestamp(&r.completed_at).or_else(|| timestamp(&r.requested_at)));

    BackupSummary {
        completed: count(BackupState::Completed),
        failed: count(BackupState::Failed),
        in_progress: count(BackupState::Starting) + count(BackupState::Running),
        last_completed: last_completed.map(|r| r.name.clone()),
        last_completed_at: last_completed.and_then(|r| r.completed_at.clone()),
        last_failure: last_failure.map(|r| {
            format!("{}: {}", r.name, r.error.as_deref().unwrap_or("failed"))
        }),
    }
}

/// Whether a backup is starting or running
pub fn backup_active(records: &[BackupRecord]) -> bool {
    records
        .iter()
        .any(|r| matches!(r.state, BackupState::Starting | BackupState::Running))
}

/// The latest Completed full backup on `storage_name` whose consistency point is at
/// or before `until` (any time when `None`)
pub fn latest_base<'r>(
    records: &'r [BackupRecord],
    storage_name: &str,
    until: Option<DateTime<Utc>>,
) -> Option<(&'r BackupRecord, DateTime<Utc>)> {
    records
        .iter()
        .filter(|r| {
            r.state == BackupState::Completed
                && r.backup_type == BackupType::Full
                && r.storage_name == storage_name
        })
        .filter_map(|r| timestamp(&r.last_write_at).map(|t| (r, t)))
        .filter(|(_, t)| until.is_none_or(|until| *t <= until))
        .max_by_key(|(_, t)| *t)
}

/// Run one backup pass over the catalog
pub async fn reconcile_backups(
    agent: &dyn BackupAgent,
    inputs: &BackupInputs<'_>,
    records: Vec<BackupRecord>,
    pitr: Option<PitrStatus>,
) -> BackupOutcome {
    let mut outcome = BackupOutcome {
        records,
        pitr,
        ..Default::default()
    };
    let spec = inputs.spec;

    if spec.enabled {
        for request in &spec.requests {
            request_backup(
                &mut outcome.records,
                &request.name,
                &request.storage_name,
                request.backup_type,
                None,
                inputs.now,
            );
        }
        for (name, index) in due_tasks(spec, &outcome.records, inputs.now) {
            let task = &spec.tasks[index];
            info!(cluster = %inputs.key, task = %task.name, backup = %name, "Scheduled backup due");
            request_backup(
                &mut outcome.records,
                &name,
                &task.storage_name,
                task.backup_type,
                Some(&task.name),
                inputs.now,
            );
        }
    }

    poll_active(agent, inputs, &mut outcome).await;
    start_next(agent, inputs, &mut outcome).await;
    apply_retention(agent, inputs, &mut outcome).await;
    reconcile_pitr(agent, inputs, &mut outcome).await;

    outcome.summary = summarize(&outcome.records);
    outcome
}

fn fail(record: &mut BackupRecord, message: String, now: DateTime<Utc>) {
    warn!(backup = %record.name, error = %message, "Backup failed");
    record.state = BackupState::Failed;
    record.error = Some(message);
    record.completed_at = Some(now.to_rfc3339());
}

fn apply_status(record: &mut BackupRecord, status: &AgentStatus, now: DateTime<Utc>) {
    match &status.phase {
        AgentPhase::Pending => {}
        AgentPhase::Running => {
            if record.state != BackupState::Running {
                info!(backup = %record.name, "Backup streaming");
                record.state = BackupState::Running;
            }
        }
        AgentPhase::Succeeded => {
            info!(backup = %record.name, "Backup completed");
            record.state = BackupState::Completed;
            record.completed_at = Some(now.to_rfc3339());
            record.last_write_at = Some(status.last_write_at.unwrap_or(now).to_rfc3339());
            record.error = None;
        }
        AgentPhase::Failed(message) => fail(record, message.clone(), now),
    }
}

async fn poll_active(agent: &dyn BackupAgent, inputs: &BackupInputs<'_>, outcome: &mut BackupOutcome) {
    let active = outcome
        .records
        .iter_mut()
        .filter(|r| matches!(r.state, BackupState::Starting | BackupState::Running));

    for record in active {
        if record.state == BackupState::Starting && record.operation.is_none() {
            // Launched by a pass that failed before it saved the operation id
            if !inputs.spec.enabled || inputs.restore_active {
                continue;
            }
            if record.member.as_ref().is_none_or(|m| !inputs.candidates.contains(m)) {
                record.member = inputs.candidates.first().cloned();
            }
            if record.member.is_none() {
                record.error = Some("waiting for a healthy member to run the backup agent".to_string());
                continue;
            }
            launch(agent, inputs, record, &mut outcome.agent_errors).await;
            continue;
        }
        let (Some(member), Some(operation)) = (record.member.clone(), record.operation.clone()) else {
            record.state = BackupState::Requested;
            continue;
        };
        let result = bounded(
            inputs.timeout,
            "backup agent status",
            agent.status(inputs.key, &member, &operation),
        )
        .await;
        match result {
            Ok(status) => apply_status(record, &status, inputs.now),
            Err(e) if is_rejected(&e) => {
                outcome.agent_errors.push(format!("{}: {}", record.name, e));
                fail(record, e.to_string(), inputs.now);
            }
            Err(e) => {
                debug!(backup = %record.name, error = %e, "Backup status unavailable");
                record.error = Some(e.to_string());
                outcome.agent_errors.push(format!("{}: {}", record.name, e));
            }
        }
    }
}

async fn start_next(agent: &dyn BackupAgent, inputs: &BackupInputs<'_>, outcome: &mut BackupOutcome) {
    if !inputs.spec.enabled || inputs.restore_active || backup_active(&outcome.records) {
        return;
    }
    let Some(record) = outcome
        .records
        .iter_mut()
        .find(|r| r.state == BackupState::Requested)
    else {
        return;
    };
    let Some(member) = inputs.candidates.first() else {
        record.error = Some("waiting for a healthy member to run the backup agent".to_string());
        return;
    };

    record.state = BackupState::Starting;
    record.member = Some(member.clone());
    record.operation = None;
    record.started_at = Some(inputs.now.to_rfc3339());
    launch(agent, inputs, record, &mut outcome.agent_errors).await;
}

/// Have the agent launch a Starting record under its own name on its member.
///
/// The agent hands back the operation already running under that name, so a
/// launch repeated after a lost pass attaches to the first one. A transient
/// failure leaves the record Starting without an operation for the next pass.
async fn launch(
    agent: &dyn BackupAgent,
    inputs: &BackupInputs<'_>,
    record: &mut BackupRecord,
    agent_errors: &mut Vec<String>,
) {
    let Some(member) = record.member.clone() else {
        return;
    };
    let Some(destination) = destination(inputs.spec, &record.storage_name) else {
        let message = format!("backup storage {} is not configured", record.storage_name);
        fail(record, message, inputs.now);
        return;
    };

    let result = bounded(
        inputs.timeout,
        "backup agent start",
        agent.start(inputs.key, &member, &destination, agent_mode(record.backup_type), &record.name),
    )
    .await;
    match result {
        Ok(operation) => {
            info!(cluster = %inputs.key, backup = %record.name, member = %member, "Backup started");
            record.operation = Some(operation);
            record.error = None;
        }
        Err(e) if is_rejected(&e) => {
            agent_errors.push(format!("{}: {}", record.name, e));
            fail(record, e.to_string(), inputs.now);
        }
        Err(e) => {
            record.error = Some(e.to_string());
            agent_errors.push(format!("{}: {}", record.name, e));
        }
    }
}

/// Failed records kept per scheduled task, and for on-demand requests
const FAILED_KEPT: usize = 5;

/// Completed on-demand backups kept after their request was withdrawn
const WITHDRAWN_KEPT: usize = 10;

fn newest_first(records: &mut [&BackupRecord]) {
    records.sort_by_key(|r| {
        std::cmp::Reverse(timestamp(&r.completed_at).or_else(|| timestamp(&r.requested_at)))
    });
}

async fn apply_retention(agent: &dyn BackupAgent, inputs: &BackupInputs<'_>, outcome: &mut BackupOutcome) {
    let requested = |name: &str| inputs.spec.requests.iter().any(|r| r.name == name);

    // Failed backups hold no restorable data; only their catalog entries go.
    // A name still requested stays so the request is not run again.
    let mut failed: BTreeMap<Option<&str>, Vec<&BackupRecord>> = BTreeMap::new();
    for record in outcome
        .records
        .iter()
        .filter(|r| r.state == BackupState::Failed && !requested(r.name.as_str()))
    {
        failed.entry(record.task.as_deref()).or_default().push(record);
    }
    let mut dropped: Vec<String> = Vec::new();
    for group in failed.values_mut() {
        newest_first(group);
        dropped.extend(group.iter().skip(FAILED_KEPT).map(|r| r.name.clone()));
    }
    if !dropped.is_empty() {
        debug!(cluster = %inputs.key, count = dropped.len(), "Dropping old failed backups from the catalog");
        outcome.records.retain(|r| !dropped.contains(&r.name));
    }

    if let Some(member) = inputs.candidates.first() {
        let expired = expired_backups(inputs, &outcome.records, &requested);
        for name in expired {
            let Some(record) = outcome.records.iter().find(|r| r.name == name) else {
                continue;
            };
            let Some(destination) = destination(inputs.spec, &record.storage_name) else {
                continue;
            };
            let result = bounded(
                inputs.timeout,
                "backup deletion",
                agent.delete_backup(inputs.key, member, &destination, &name),
            )
            .await;
            match result {
                Ok(()) => {
                    info!(cluster = %inputs.key, backup = %name, "Pruned backup beyond retention");
                    outcome.records.retain(|r| r.name != name);
                }
                Err(e) => outcome.agent_errors.push(format!("{}: {}", name, e)),
            }
        }
    }

    prune_chunks(&mut outcome.records);
}

/// Completed backups past their task's `keep`, and withdrawn on-demand backups
/// past the newest few
fn expired_backups(
    inputs: &BackupInputs<'_>,
    records: &[BackupRecord],
    requested: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    let mut expired: Vec<String> = Vec::new();
    for task in inputs.spec.tasks.iter().filter(|t| t.keep > 0) {
        let mut completed: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.task.as_deref() == Some(task.name.as_str()) && r.state == BackupState::Completed)
            .collect();
        newest_first(&mut completed);
        expired.extend(completed.iter().skip(task.keep as usize).map(|r| r.name.clone()));
    }

    let mut withdrawn: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| {
            r.task.is_none()
                && r.backup_type != BackupType::PitrChunk
                && r.state == BackupState::Completed
                && !requested(r.name.as_str())
        })
        .collect();
    newest_first(&mut withdrawn);
    expired.extend(withdrawn.iter().skip(WITHDRAWN_KEPT).map(|r| r.name.clone()));
    expired
}

/// Drop PITR chunks that end before the oldest base backup still in the catalog,
/// or whose storage holds no base backup at all; nothing can replay them
fn prune_chunks(records: &mut Vec<BackupRecord>) {
    let oldest_base = |storage: &str| {
        records
            .iter()
            .filter(|r| {
                r.state == BackupState::Completed
                    && r.backup_type == BackupType::Full
                    && r.storage_name == storage
            })
            .filter_map(|r| timestamp(&r.last_write_at))
            .min()
    };
    let stale: Vec<String> = records
        .iter()
        .filter(|r| r.backup_type == BackupType::PitrChunk)
        .filter(|r| match (oldest_base(&r.storage_name), timestamp(&r.last_write_at)) {
            (Some(base), Some(end)) => end < base,
            (None, _) => true,
            (Some(_), None) => false,
        })
        .map(|r| r.name.clone())
        .collect();
    records.retain(|r| !stale.contains(&r.name));
}

/// Catalog name of a PITR chunk
pub fn chunk_name(start: DateTime<Utc>) -> String {
    format!("pitr-{}", start.format("%Y%m%d%H%M%S"))
}

async fn reconcile_pitr(agent: &dyn BackupAgent, inputs: &BackupInputs<'_>, outcome: &mut BackupOutcome) {
    let wanted = inputs
        .spec
        .pitr
        .as_ref()
        .filter(|p| p.enabled && inputs.spec.enabled && !inputs.restore_active);

    let mut pitr = outcome.pitr.take().unwrap_or_default();
    let running_elsewhere = pitr.running && wanted.is_some_and(|w| w.storage_name != pitr.storage_name);

    if pitr.running && (wanted.is_none() || running_elsewhere) {
        if let (Some(member), Some(operation)) = (pitr.member.clone(), pitr.operation.clone()) {
            match bounded(inputs.timeout, "pitr stop", agent.stop(inputs.key, &member, &operation)).await {
                Ok(()) => {
                    info!(cluster = %inputs.key, storage = %pitr.storage_name, "Stopped continuous capture");
                    pitr.running = false;
                    pitr.operation = None;
                }
                Err(e) => {
                    pitr.error = Some(e.to_string());
                    outcome.agent_errors.push(format!("pitr: {}", e));
                }
            }
        } else {
            pitr.running = false;
        }
    }

    let Some(wanted) = wanted else {
        outcome.pitr = (!pitr.storage_name.is_empty() || pitr.running).then_some(pitr);
        return;
    };
    if pitr.running {
        poll_pitr(agent, inputs, &mut pitr, &mut outcome.records, &mut outcome.agent_errors).await;
        outcome.pitr = Some(pitr);
        return;
    }

    pitr.storage_name = wanted.storage_name.clone();
    let has_base = latest_base(&outcome.records, &wanted.storage_name, None).is_some();
    let Some(member) = inputs.candidates.first() else {
        outcome.pitr = Some(pitr);
        return;
    };
    let Some(destination) = destination(inputs.spec, &wanted.storage_name).filter(|_| has_base) else {
        outcome.pitr = Some(pitr);
        return;
    };

    match bounded(
        inputs.timeout,
        "pitr start",
        agent.start(inputs.key, member, &destination, AgentMode::Pitr, "pitr"),
    )
    .await
    {
        Ok(operation) => {
            info!(cluster = %inputs.key, storage = %wanted.storage_name, member = %member, "Started continuous capture");
            pitr.running = true;
            pitr.member = Some(member.clone());
            pitr.operation = Some(operation);
            pitr.error = None;
        }
        Err(e) => {
            pitr.error = Some(e.to_string());
            outcome.agent_errors.push(format!("pitr: {}", e));
        }
    }
    outcome.pitr = Some(pitr);
}

async fn poll_pitr(
    agent: &dyn BackupAgent,
    inputs: &BackupInputs<'_>,
    pitr: &mut PitrStatus,
    records: &mut Vec<BackupRecord>,
    agent_errors: &mut Vec<String>,
) {
    let (Some(member), Some(operation)) = (pitr.member.clone(), pitr.operation.clone()) else {
        pitr.running = false;
        return;
    };
    let status = match bounded(inputs.timeout, "pitr status", agent.status(inputs.key, &member, &operation)).await {
        Ok(status) => status,
        Err(e) => {
            if is_rejected(&e) {
                pitr.running = false;
            }
            pitr.error = Some(e.to_string());
            agent_errors.push(format!("pitr: {}", e));
            return;
        }
    };

    for chunk in &status.chunks {
        let name = chunk_name(chunk.start);
        if records.iter().any(|r| r.name == name) {
            continue;
        }
        records.push(BackupRecord {
            name,
            storage_name: pitr.storage_name.clone(),
            backup_type: BackupType::PitrChunk,
            state: BackupState::Completed,
            task: None,
            member: Some(member.clone()),
            operation: Some(operation.clone()),
            requested_at: Some(chunk.start.to_rfc3339()),
            started_at: Some(chunk.start.to_rfc3339()),
            completed_at: Some(chunk.end.to_rfc3339()),
            last_write_at: Some(chunk.end.to_rfc3339()),
            chunk_start: Some(chunk.start.to_rfc3339()),
            error: None,
        });
    }

    match &status.phase {
        AgentPhase::Failed(message) => {
            warn!(cluster = %inputs.key, error = %message, "Continuous capture failed");
            pitr.running = false;
            pitr.error = Some(message.clone());
            agent_errors.push(format!("pitr: {}", message));
        }
        AgentPhase::Succeeded => pitr.running = false,
        AgentPhase::Pending | AgentPhase::Running => pitr.error = None,
    }
}
