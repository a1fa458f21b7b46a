use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default MongoDB server image used when neither the cluster nor a replica set overrides it
pub const DEFAULT_MONGOD_IMAGE: &str = "percona/percona-server-mongodb:7.0";

/// MongoCluster is the Schema for the mongoclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "mongodb.example.com",
    version = "v1alpha1",
    kind = "MongoCluster",
    plural = "mongoclusters",
    shortname = "mgc",
    namespaced,
    status = "MongoClusterStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Sharded", "type":"boolean", "jsonPath":".spec.sharding.enabled"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MongoClusterSpec {
    /// Server image applied to every replica set that does not override it
    #[serde(default = "default_image")]
    pub image: String,

    /// Replica sets. In sharded mode these are the data shards.
    pub replica_sets: Vec<ReplicaSetSpec>,

    /// Sharding topology (config server replica set and routers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSpec>,

    /// Backup storages, schedules, on-demand requests and PITR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Restore request. A new `name` starts a new restore.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// Database users whose credentials are managed by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialPolicy>,

    /// How image and configuration changes are rolled out
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

fn default_image() -> String {
    DEFAULT_MONGOD_IMAGE.to_string()
}

impl MongoClusterSpec {
    /// Whether the cluster runs as a sharded cluster
    pub fn is_sharded(&self) -> bool {
        self.sharding.as_ref().is_some_and(|s| s.enabled)
    }

    /// Image a replica set should run
    pub fn image_for(&self, rs: &ReplicaSetSpec) -> String {
        rs.image.clone().unwrap_or_else(|| self.image.clone())
    }
}

/// A replica set definition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetSpec {
    /// Replica set name, unique within the cluster
    pub name: String,

    /// Number of voting, data-bearing members
    #[serde(default = "default_size")]
    pub size: i32,

    /// Storage requested for every member
    pub storage: StorageSpec,

    /// Image override for this replica set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Server parameter overrides, passed to mongod as `--setParameter name=value`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configuration: BTreeMap<String, String>,
}

fn default_size() -> i32 {
    3
}

/// Storage configuration for member data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi")
    pub size: String,
}

/// Sharding topology
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    pub enabled: bool,

    /// Config server replica set, distinct from every shard
    pub config_server: ReplicaSetSpec,

    /// Query routers (mongos)
    pub routers: RouterSpec,
}

/// Query router (mongos) tier
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    #[serde(default = "default_router_size")]
    pub size: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

fn default_router_size() -> i32 {
    2
}

/// Rollout strategy for image and configuration changes
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Changes are only reported; members are never updated automatically
    Manual,
    /// Members are updated in descending ordinal, gated on workload readiness
    RollingUpdate,
    /// Members are updated one at a time, secondaries first, gated on database health
    #[default]
    SmartUpdate,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Named storage destinations
    #[serde(default)]
    pub storages: BTreeMap<String, BackupStorage>,

    /// Scheduled backup tasks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<BackupTask>,

    /// On-demand backup requests, identified by name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<BackupRequest>,

    /// Continuous point-in-time recovery capture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr: Option<PitrSpec>,

    /// Delete backup metadata from storage when the cluster is deleted
    #[serde(default)]
    pub delete_on_finalize: bool,
}

fn default_true() -> bool {
    true
}

/// Backup storage destination
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BackupStorage {
    /// S3 or S3-compatible object storage
    S3 {
        bucket: String,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        credentials_secret: String,
    },
    /// Azure Blob Storage
    Azure {
        container: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        credentials_secret: String,
    },
    /// Shared filesystem mounted into every member
    Filesystem { path: String },
}

impl BackupStorage {
    /// Get the storage type as a string
    pub fn storage_type(&self) -> &'static str {
        match self {
            BackupStorage::S3 { .. } => "s3",
            BackupStorage::Azure { .. } => "azure",
            BackupStorage::Filesystem { .. } => "filesystem",
        }
    }
}

/// Scheduled backup task
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupTask {
    pub name: String,

    /// Interval between backups (e.g., "6h", "1d", "30m")
    pub schedule: String,

    pub storage_name: String,

    #[serde(default)]
    pub backup_type: BackupType,

    /// Number of completed backups of this task to retain (0 keeps everything)
    #[serde(default)]
    pub keep: i32,
}

/// On-demand backup request
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    /// Request identity. Re-requesting the same name never creates a second backup.
    pub name: String,

    pub storage_name: String,

    #[serde(default)]
    pub backup_type: BackupType,
}

/// Point-in-time recovery capture
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PitrSpec {
    pub enabled: bool,

    pub storage_name: String,
}

/// Kind of backup
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupType {
    #[default]
    Full,
    Incremental,
    PitrChunk,
}

/// Restore request
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Restore identity
    pub name: String,

    pub storage_name: String,

    /// Restore a specific completed backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<String>,

    /// Restore to a point in time (RFC3339). Mutually exclusive with `backupName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr_target: Option<String>,
}

/// Database users managed by the operator
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPolicy {
    /// Secret holding the current credentials
    pub secret_name: String,

    #[serde(default)]
    pub users: Vec<DatabaseUser>,
}

/// A managed database user
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseUser {
    pub name: String,

    /// Increment to request a rotation
    #[serde(default)]
    pub generation: i64,

    /// Processes cache this credential in memory and must be restarted after rotation
    #[serde(default)]
    pub cached_in_memory: bool,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the MongoCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoClusterStatus {
    /// Overall phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Per replica set readiness and rollout state, keyed by replica set name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_sets: BTreeMap<String, ReplicaSetStatus>,

    /// Router readiness (sharded clusters only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routers: Option<RouterStatus>,

    /// Backup catalog, owned by the backup orchestrator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backups: Vec<BackupRecord>,

    /// Read-only projection of the backup catalog
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_summary: Option<BackupSummary>,

    /// Continuous capture agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitr: Option<PitrStatus>,

    /// Most recent restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreStatus>,

    /// Credential rotation progress, keyed by user name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialStatus>,

    /// Most specific known cause of the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<String>,

    /// Consecutive failed passes, drives backoff and the retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<String>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Initializing,
    Ready,
    Error,
    Stopping,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Initializing => write!(f, "Initializing"),
            ClusterPhase::Ready => write!(f, "Ready"),
            ClusterPhase::Error => write!(f, "Error"),
            ClusterPhase::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Readiness and rollout state of one replica set
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetStatus {
    /// Desired size
    pub size: i32,

    /// Members reporting Healthy
    pub ready: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    /// Whether the database-side replica set has ever reported itself initiated
    #[serde(default)]
    pub initialized: bool,

    /// Whether the cluster admin user exists on this replica set
    #[serde(default)]
    pub admin_ready: bool,

    /// Whether the shard has been registered with the routers
    #[serde(default)]
    pub registered: bool,

    /// Set while a restore isolates this replica set from rollouts
    #[serde(default)]
    pub paused: bool,

    #[serde(default)]
    pub rollout: RolloutState,
}

/// Router tier readiness
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    pub size: i32,
    pub ready: i32,
    #[serde(default)]
    pub rollout: RolloutState,
}

/// Persisted, resumable rollout state of one replica set
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    #[serde(default)]
    pub phase: RolloutPhase,

    /// Action being applied or verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<RolloutAction>,

    /// Remaining plan, recomputed every pass
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<RolloutAction>,

    /// Passes spent without progress on the current action
    #[serde(default)]
    pub stalled_passes: u32,

    /// Members whose processes must be restarted (credential rotation)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_restarts: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Spec generation that entered Error; a newer generation clears it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_generation: Option<i64>,
}

/// Rollout state machine phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RolloutPhase {
    #[default]
    Stable,
    Planning,
    Mutating,
    Verifying,
    Error,
}

impl std::fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutPhase::Stable => write!(f, "Stable"),
            RolloutPhase::Planning => write!(f, "Planning"),
            RolloutPhase::Mutating => write!(f, "Mutating"),
            RolloutPhase::Verifying => write!(f, "Verifying"),
            RolloutPhase::Error => write!(f, "Error"),
        }
    }
}

/// A single-member rollout action. Members are named `<cluster>-<replset>-<ordinal>`.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(tag = "action", content = "member")]
pub enum RolloutAction {
    Create(String),
    Delete(String),
    UpdateInPlace(String),
    Restart(String),
}

impl RolloutAction {
    /// Member targeted by this action
    pub fn member(&self) -> &str {
        match self {
            RolloutAction::Create(m)
            | RolloutAction::Delete(m)
            | RolloutAction::UpdateInPlace(m)
            | RolloutAction::Restart(m) => m,
        }
    }
}

impl std::fmt::Display for RolloutAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutAction::Create(m) => write!(f, "create {}", m),
            RolloutAction::Delete(m) => write!(f, "delete {}", m),
            RolloutAction::UpdateInPlace(m) => write!(f, "update {}", m),
            RolloutAction::Restart(m) => write!(f, "restart {}", m),
        }
    }
}

/// A backup catalog entry
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Request identity
    pub name: String,

    pub storage_name: String,

    pub backup_type: BackupType,

    pub state: BackupState,

    /// Scheduled task that produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Member running the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,

    /// Agent operation identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Consistency point: the backup contains every write up to this time.
    /// For PITR chunks this is the end of the chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_write_at: Option<String>,

    /// Start of a PITR chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_start: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backup lifecycle state
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum BackupState {
    #[default]
    Requested,
    Starting,
    Running,
    Completed,
    Failed,
}

impl BackupState {
    /// Completed and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupState::Completed | BackupState::Failed)
    }
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupState::Requested => write!(f, "Requested"),
            BackupState::Starting => write!(f, "Starting"),
            BackupState::Running => write!(f, "Running"),
            BackupState::Completed => write!(f, "Completed"),
            BackupState::Failed => write!(f, "Failed"),
        }
    }
}

/// Read-only projection of the backup catalog
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub completed: i32,
    pub failed: i32,
    pub in_progress: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// Continuous PITR capture state
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrStatus {
    pub storage_name: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Restore progress
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    pub name: String,

    pub phase: RestorePhase,

    /// Base backup being restored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backup: Option<String>,

    /// PITR chunks replayed on top of the base backup
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<String>,

    /// Member running the restore agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,

    /// Agent operation identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Whether data on the members may already have been overwritten
    #[serde(default)]
    pub data_touched: bool,

    #[serde(default)]
    pub stalled_passes: u32,

    /// What the restore is waiting for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Restore state machine phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RestorePhase {
    #[default]
    RestoreRequested,
    Preparing,
    Restoring,
    Verifying,
    Ready,
    Failed,
}

impl RestorePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestorePhase::Ready | RestorePhase::Failed)
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestorePhase::RestoreRequested => write!(f, "RestoreRequested"),
            RestorePhase::Preparing => write!(f, "Preparing"),
            RestorePhase::Restoring => write!(f, "Restoring"),
            RestorePhase::Verifying => write!(f, "Verifying"),
            RestorePhase::Ready => write!(f, "Ready"),
            RestorePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Credential rotation progress for one user
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStatus {
    /// Generation currently active everywhere
    #[serde(default)]
    pub generation: i64,

    /// Generation being rolled out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_generation: Option<i64>,

    #[serde(default)]
    pub step: RotationStep,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Persisted credential rotation step
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum RotationStep {
    #[default]
    Idle,
    /// New credential generated and durably stored as pending
    PendingStored,
    /// New credential accepted by the database
    Applied,
    /// New credential durably stored as the active one
    Stored,
    /// Old credential invalidated on the database side
    Revoked,
    /// Waiting for processes caching the credential to restart
    Restarting,
}

impl std::fmt::Display for RotationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationStep::Idle => write!(f, "Idle"),
            RotationStep::PendingStored => write!(f, "PendingStored"),
            RotationStep::Applied => write!(f, "Applied"),
            RotationStep::Stored => write!(f, "Stored"),
            RotationStep::Revoked => write!(f, "Revoked"),
            RotationStep::Restarting => write!(f, "Restarting"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
