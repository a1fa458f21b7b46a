//! Backup agent client
//!
//! The backup agent is a controllable process running next to every data member.
//! The controller starts operations, polls their status and stops them; it does
//! not know how the agent moves data. [`PbmAgent`] drives Percona Backup for
//! MongoDB through its `pbm` CLI in the agent sidecar.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::Client;
use serde::Deserialize;
use tracing::debug;

use crate::crd::BackupStorage;
use crate::resources::common::ClusterKey;
use crate::resources::exec::{ExecError, PodExec};

/// Sidecar container running the backup agent
pub const AGENT_CONTAINER: &str = "backup-agent";

/// Errors from the backup agent client
#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    #[error("exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("agent call to {member} timed out")]
    Timeout { member: String },

    /// The agent refused the operation; retrying the same call will not help
    #[error("agent on {member} rejected the request: {message}")]
    Rejected { member: String, message: String },

    #[error("unexpected agent output from {member}: {message}")]
    Parse { member: String, message: String },
}

impl AgentClientError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentClientError::Rejected { .. })
    }
}

/// What the agent should capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentMode {
    Full,
    Incremental,
    /// Continuous oplog capture for point-in-time recovery
    Pitr,
}

/// A storage destination handed to the agent
#[derive(Clone, Debug, PartialEq)]
pub struct Destination {
    pub name: String,
    pub storage: BackupStorage,
}

/// Progress of an agent operation
#[derive(Clone, Debug, PartialEq)]
pub enum AgentPhase {
    /// Accepted but not yet streaming
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// A closed continuous-capture chunk
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Status report of one agent operation
#[derive(Clone, Debug, PartialEq)]
pub struct AgentStatus {
    pub phase: AgentPhase,
    /// Consistency point of a finished backup
    pub last_write_at: Option<DateTime<Utc>>,
    /// Chunks closed so far by a continuous capture
    pub chunks: Vec<ChunkReport>,
}

impl AgentStatus {
    pub fn with_phase(phase: AgentPhase) -> Self {
        Self {
            phase,
            last_write_at: None,
            chunks: Vec::new(),
        }
    }
}

#[async_trait]
pub trait BackupAgent: Send + Sync {
    /// Start a backup or continuous capture on `member`; returns the operation id
    async fn start(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        mode: AgentMode,
        name: &str,
    ) -> Result<String, AgentClientError>;

    async fn status(&self, cluster: &ClusterKey, member: &str, operation: &str) -> Result<AgentStatus, AgentClientError>;

    async fn stop(&self, cluster: &ClusterKey, member: &str, operation: &str) -> Result<(), AgentClientError>;

    /// Delete a backup's data and metadata from its destination
    async fn delete_backup(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        name: &str,
    ) -> Result<(), AgentClientError>;

    /// Restore `base`, replaying continuous capture up to `until` when set
    async fn restore(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        base: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<String, AgentClientError>;
}

/// [`BackupAgent`] backed by the `pbm` CLI in the agent sidecar
#[derive(Clone)]
pub struct PbmAgent {
    exec: PodExec,
}

impl PbmAgent {
    pub fn new(client: Client) -> Self {
        Self {
            exec: PodExec::new(client, AGENT_CONTAINER),
        }
    }

    async fn pbm(&self, cluster: &ClusterKey, member: &str, args: &[&str]) -> Result<String, AgentClientError> {
        let mut command = vec!["pbm"];
        command.extend_from_slice(args);
        command.push("--out=json");
        debug!(member, ?args, "Running backup agent command");
        match self.exec.run(&cluster.namespace, member, &command).await {
            Ok(output) => Ok(output),
            Err(ExecError::Failed { message, .. }) if is_rejection(&message) => Err(AgentClientError::Rejected {
                member: member.to_string(),
                message,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Point the agent at the destination before any data operation
    async fn configure(&self, cluster: &ClusterKey, member: &str, destination: &Destination) -> Result<(), AgentClientError> {
        let settings = storage_settings(&destination.storage);
        let args: Vec<&str> = std::iter::once("config")
            .chain(settings.iter().map(String::as_str))
            .collect();
        self.pbm(cluster, member, &args).await.map(|_| ())
    }
}

fn is_rejection(message: &str) -> bool {
    ["not found", "invalid", "another operation", "no such"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn storage_settings(storage: &BackupStorage) -> Vec<String> {
    match storage {
        BackupStorage::S3 {
            bucket,
            region,
            endpoint,
            prefix,
            ..
        } => {
            let mut settings = vec![
                "--set=storage.type=s3".to_string(),
                format!("--set=storage.s3.bucket={}", bucket),
                format!("--set=storage.s3.region={}", region),
            ];
            if let Some(endpoint) = endpoint {
                settings.push(format!("--set=storage.s3.endpointUrl={}", endpoint));
            }
            if let Some(prefix) = prefix {
                settings.push(format!("--set=storage.s3.prefix={}", prefix));
            }
            settings
        }
        BackupStorage::Azure {
            container, prefix, ..
        } => {
            let mut settings = vec![
                "--set=storage.type=azure".to_string(),
                format!("--set=storage.azure.container={}", container),
            ];
            if let Some(prefix) = prefix {
                settings.push(format!("--set=storage.azure.prefix={}", prefix));
            }
            settings
        }
        BackupStorage::Filesystem { path } => vec![
            "--set=storage.type=filesystem".to_string(),
            format!("--set=storage.filesystem.path={}", path),
        ],
    }
}

#[derive(Debug, Deserialize)]
struct PbmStarted {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PbmDescribe {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    last_write_ts: Option<i64>,
    #[serde(default)]
    chunks: Vec<PbmChunk>,
}

#[derive(Debug, Deserialize)]
struct PbmChunk {
    start: i64,
    end: i64,
}

fn parse_describe(member: &str, output: &str) -> Result<AgentStatus, AgentClientError> {
    let raw: PbmDescribe = serde_json::from_str(output.trim()).map_err(|e| AgentClientError::Parse {
        member: member.to_string(),
        message: e.to_string(),
    })?;
    let status = raw.status;
    let phase = match status.as_str() {
        "starting" | "waiting" => AgentPhase::Pending,
        "running" | "dumpDone" | "copyDone" => AgentPhase::Running,
        "done" => AgentPhase::Succeeded,
        "error" | "cancelled" => AgentPhase::Failed(raw.error.unwrap_or_else(|| status.clone())),
        other => {
            return Err(AgentClientError::Parse {
                member: member.to_string(),
                message: format!("unknown status {}", other),
            });
        }
    };
    Ok(AgentStatus {
        phase,
        last_write_at: raw.last_write_ts.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        chunks: raw
            .chunks
            .into_iter()
            .filter_map(|c| {
                Some(ChunkReport {
                    start: DateTime::from_timestamp(c.start, 0)?,
                    end: DateTime::from_timestamp(c.end, 0)?,
                })
            })
            .collect(),
    })
}

fn parse_started(member: &str, output: &str) -> Result<String, AgentClientError> {
    serde_json::from_str::<PbmStarted>(output.trim())
        .map(|s| s.name)
        .map_err(|e| AgentClientError::Parse {
            member: member.to_string(),
            message: e.to_string(),
        })
}

#[async_trait]
impl BackupAgent for PbmAgent {
    async fn start(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        mode: AgentMode,
        name: &str,
    ) -> Result<String, AgentClientError> {
        self.configure(cluster, member, destination).await?;
        match mode {
            AgentMode::Pitr => {
                self.pbm(cluster, member, &["config", "--set=pitr.enabled=true"]).await?;
                Ok(format!("pitr-{}", destination.name))
            }
            AgentMode::Full | AgentMode::Incremental => {
                // A backup launched by a pass whose result was lost is picked up again by name
                match self.pbm(cluster, member, &["describe-backup", name]).await {
                    Ok(_) => {
                        debug!(member, backup = name, "Backup already launched");
                        return Ok(name.to_string());
                    }
                    Err(AgentClientError::Rejected { message, .. }) if message.contains("not found") => {}
                    Err(e) => return Err(e),
                }
                let backup_type = if mode == AgentMode::Full {
                    "--type=logical"
                } else {
                    "--type=incremental"
                };
                let output = self
                    .pbm(cluster, member, &["backup", backup_type, "--wait=false", &format!("--name={}", name)])
                    .await?;
                parse_started(member, &output)
            }
        }
    }

    async fn status(&self, cluster: &ClusterKey, member: &str, operation: &str) -> Result<AgentStatus, AgentClientError> {
        let output = if operation.starts_with("pitr-") {
            self.pbm(cluster, member, &["status", "--sections=pitr"]).await?
        } else if operation.starts_with("restore-") {
            self.pbm(cluster, member, &["describe-restore", operation]).await?
        } else {
            self.pbm(cluster, member, &["describe-backup", operation]).await?
        };
        parse_describe(member, &output)
    }

    async fn stop(&self, cluster: &ClusterKey, member: &str, operation: &str) -> Result<(), AgentClientError> {
        if operation.starts_with("pitr-") {
            self.pbm(cluster, member, &["config", "--set=pitr.enabled=false"]).await?;
        } else {
            self.pbm(cluster, member, &["cancel-backup"]).await?;
        }
        Ok(())
    }

    async fn delete_backup(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        name: &str,
    ) -> Result<(), AgentClientError> {
        self.configure(cluster, member, destination).await?;
        match self.pbm(cluster, member, &["delete-backup", "--yes", name]).await {
            Err(AgentClientError::Rejected { message, .. }) if message.contains("not found") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn restore(
        &self,
        cluster: &ClusterKey,
        member: &str,
        destination: &Destination,
        base: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<String, AgentClientError> {
        self.configure(cluster, member, destination).await?;
        let output = match until {
            Some(target) => {
                let time = format!("--time={}", target.format("%Y-%m-%dT%H:%M:%S"));
                let base = format!("--base-snapshot={}", base);
                self.pbm(cluster, member, &["restore", &time, &base]).await?
            }
            None => self.pbm(cluster, member, &["restore", base]).await?,
        };
        parse_started(member, &output).map(|name| format!("restore-{}", name))
    }
}
