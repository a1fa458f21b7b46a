//! Semantic validation of the MongoCluster spec
//!
//! Schema-level checks belong to admission; these are the invariants the
//! controller enforces at reconcile time before it mutates anything:
//! - replica set names are unique and usable in workload names
//! - sharded clusters have a config server distinct from every shard
//! - every storage a task, request, PITR or restore refers to exists
//! - schedules, sizes and restore targets parse

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::controller::error::{Error, Result};
use crate::controller::topology::ROUTER_SET;
use crate::crd::{MongoClusterSpec, ReplicaSetSpec};

/// Minimum number of members of a replica set
pub const MIN_MEMBERS: i32 = 1;

/// Maximum number of voting members a replica set supports
pub const MAX_MEMBERS: i32 = 7;

/// Validate the cluster spec
pub fn validate_spec(spec: &MongoClusterSpec) -> Result<()> {
    validate_replica_sets(spec)?;
    validate_backup(spec)?;
    validate_restore(spec)?;
    validate_credentials(spec)?;
    Ok(())
}

fn validate_replica_sets(spec: &MongoClusterSpec) -> Result<()> {
    if spec.replica_sets.is_empty() {
        return Err(Error::ValidationError(
            "at least one replica set is required".to_string(),
        ));
    }

    let sharding = spec.sharding.as_ref().filter(|s| s.enabled);
    if let Some(sharding) = sharding {
        if sharding.routers.size < 1 {
            return Err(Error::ValidationError(format!(
                "sharded clusters need at least one router, got {}",
                sharding.routers.size
            )));
        }
        if spec.replica_sets.iter().any(|rs| rs.name == sharding.config_server.name) {
            return Err(Error::ValidationError(format!(
                "config server {} must be distinct from the data shards",
                sharding.config_server.name
            )));
        }
    }

    let mut names = BTreeSet::new();
    for rs in spec.replica_sets.iter().chain(sharding.map(|s| &s.config_server)) {
        validate_replica_set(rs)?;
        if !names.insert(rs.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "replica set name {} is used more than once",
                rs.name
            )));
        }
    }

    Ok(())
}

fn validate_replica_set(rs: &ReplicaSetSpec) -> Result<()> {
    let valid_name = !rs.name.is_empty()
        && rs.name.len() <= 40
        && rs
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !rs.name.starts_with('-')
        && !rs.name.ends_with('-');
    if !valid_name {
        return Err(Error::ValidationError(format!(
            "replica set name {:?} must be 1-40 lowercase alphanumerics or '-'",
            rs.name
        )));
    }
    if rs.name == ROUTER_SET {
        return Err(Error::ValidationError(format!(
            "replica set name {} is reserved for routers",
            ROUTER_SET
        )));
    }

    if rs.size < MIN_MEMBERS || rs.size > MAX_MEMBERS {
        return Err(Error::ValidationError(format!(
            "replica set {} size {} must be between {} and {}",
            rs.name, rs.size, MIN_MEMBERS, MAX_MEMBERS
        )));
    }

    validate_storage_size(&rs.name, &rs.storage.size)
}

/// Validate storage size format (e.g. "10Gi")
fn validate_storage_size(replset: &str, size: &str) -> Result<()> {
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size of {} must end with Gi, Mi, or Ti: {}",
            replset, size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    num_str.parse::<u64>().map_err(|_| {
        Error::ValidationError(format!("invalid storage size number of {}: {}", replset, size))
    })?;

    Ok(())
}

fn validate_backup(spec: &MongoClusterSpec) -> Result<()> {
    let Some(backup) = &spec.backup else {
        return Ok(());
    };

    let storage_exists = |owner: &str, name: &str| -> Result<()> {
        if backup.storages.contains_key(name) {
            Ok(())
        } else {
            Err(Error::ValidationError(format!(
                "{} refers to unknown backup storage {}",
                owner, name
            )))
        }
    };

    let mut task_names = BTreeSet::new();
    for task in &backup.tasks {
        if !task_names.insert(task.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "backup task {} is defined more than once",
                task.name
            )));
        }
        storage_exists(&format!("backup task {}", task.name), &task.storage_name)?;
        if parse_interval(&task.schedule).is_none() {
            return Err(Error::ValidationError(format!(
                "backup task {} has an invalid schedule {:?} (expected e.g. 30m, 6h, 1d)",
                task.name, task.schedule
            )));
        }
        if task.keep < 0 {
            return Err(Error::ValidationError(format!(
                "backup task {} has a negative retention count",
                task.name
            )));
        }
    }

    let mut request_names = BTreeSet::new();
    for request in &backup.requests {
        if !request_names.insert(request.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "backup request {} is defined more than once",
                request.name
            )));
        }
        storage_exists(&format!("backup request {}", request.name), &request.storage_name)?;
    }

    if let Some(pitr) = backup.pitr.as_ref().filter(|p| p.enabled) {
        storage_exists("point-in-time recovery", &pitr.storage_name)?;
    }

    Ok(())
}

fn validate_restore(spec: &MongoClusterSpec) -> Result<()> {
    let Some(restore) = &spec.restore else {
        return Ok(());
    };

    let known = spec
        .backup
        .as_ref()
        .is_some_and(|b| b.storages.contains_key(&restore.storage_name));
    if !known {
        return Err(Error::ValidationError(format!(
            "restore {} refers to unknown backup storage {}",
            restore.name, restore.storage_name
        )));
    }
    if restore.backup_name.is_some() && restore.pitr_target.is_some() {
        return Err(Error::ValidationError(format!(
            "restore {} sets both backupName and pitrTarget",
            restore.name
        )));
    }
    if let Some(target) = &restore.pitr_target {
        parse_timestamp(target).ok_or_else(|| {
            Error::ValidationError(format!(
                "restore {} has an invalid pitrTarget {:?} (expected RFC 3339)",
                restore.name, target
            ))
        })?;
    }

    Ok(())
}

fn validate_credentials(spec: &MongoClusterSpec) -> Result<()> {
    let Some(policy) = &spec.credentials else {
        return Ok(());
    };

    if policy.secret_name.is_empty() {
        return Err(Error::ValidationError(
            "credential policy needs a secretName".to_string(),
        ));
    }
    let mut users = BTreeSet::new();
    for user in &policy.users {
        if user.name.is_empty() || user.name.contains('.') {
            return Err(Error::ValidationError(format!(
                "invalid database user name {:?}",
                user.name
            )));
        }
        if !users.insert(user.name.as_str()) {
            return Err(Error::ValidationError(format!(
                "database user {} is listed more than once",
                user.name
            )));
        }
        if user.generation < 0 {
            return Err(Error::ValidationError(format!(
                "database user {} has a negative generation",
                user.name
            )));
        }
    }

    Ok(())
}

/// Parse an interval such as "45s", "30m", "6h" or "1d"
pub fn parse_interval(s: &str) -> Option<chrono::Duration> {
    let s = s.trim();
    let (last, _) = s.char_indices().last()?;
    let (num, unit) = s.split_at(last);
    let n: i64 = num.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "s" => Some(chrono::Duration::seconds(n)),
        "m" => Some(chrono::Duration::minutes(n)),
        "h" => Some(chrono::Duration::hours(n)),
        "d" => Some(chrono::Duration::days(n)),
        _ => None,
    }
}

/// Parse an RFC 3339 timestamp into UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
