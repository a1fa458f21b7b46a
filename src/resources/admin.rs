//! Administrative interface of the database engine
//!
//! [`DatabaseAdmin`] is what the controller needs from the database: replica set
//! status, membership reconfiguration, shard registration and user management.
//! Members are always named by pod name; translating to network hosts is the
//! implementation's job.
//!
//! [`MongoshAdmin`] implements it by running `mongosh` inside the member pod.
//! Every script first authenticates as the cluster admin. Until that user exists
//! the connection stays unauthenticated and relies on the localhost exception,
//! which is enough to initiate the replica set and create the admin itself.

use async_trait::async_trait;
use kube::Client;
use serde::Deserialize;
use tracing::debug;

use crate::resources::common::ClusterKey;
use crate::resources::exec::{ExecError, PodExec};

/// Container running mongod/mongos in every member pod
pub const MONGOD_CONTAINER: &str = "mongod";

/// Errors from the database admin client
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("unexpected admin output from {pod}: {message}")]
    Parse { pod: String, message: String },

    #[error("command rejected by {pod}: {message}")]
    Command { pod: String, message: String },

    #[error("admin call to {pod} timed out")]
    Timeout { pod: String },
}

/// Replica set member state as reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Recovering,
    Arbiter,
    Down,
    Removed,
    Unknown,
}

impl MemberState {
    /// Map the numeric `state` field of `replSetGetStatus`
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => MemberState::Primary,
            2 => MemberState::Secondary,
            0 | 5 => MemberState::Startup,
            3 | 9 => MemberState::Recovering,
            7 => MemberState::Arbiter,
            8 => MemberState::Down,
            10 => MemberState::Removed,
            _ => MemberState::Unknown,
        }
    }
}

/// One member entry of a replica set status
#[derive(Clone, Debug, PartialEq)]
pub struct MemberStatus {
    /// Pod name of the member
    pub pod: String,
    pub state: MemberState,
    /// Whether the reporting member can reach this one
    pub healthy: bool,
    pub ping_ms: Option<u64>,
    /// Last applied operation time, seconds since the epoch
    pub optime: Option<i64>,
}

/// Replica set status as seen from one member
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ReplSetStatus {
    /// Replica set name the answering member belongs to
    pub set_name: String,
    pub initialized: bool,
    pub members: Vec<MemberStatus>,
}

impl ReplSetStatus {
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }
}

#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Replica set status as seen by `pod`
    async fn replset_status(&self, cluster: &ClusterKey, replset: &str, pod: &str) -> Result<ReplSetStatus, AdminError>;

    /// Create the cluster admin user through `primary` unless it already exists
    async fn bootstrap_admin(&self, cluster: &ClusterKey, replset: &str, primary: &str) -> Result<(), AdminError>;

    /// Initiate a replica set with `pod` as its only member
    async fn initiate(&self, cluster: &ClusterKey, replset: &str, pod: &str, config_server: bool) -> Result<(), AdminError>;

    /// Add `member` to the replica set configuration through `primary`. Idempotent.
    async fn add_member(&self, cluster: &ClusterKey, replset: &str, primary: &str, member: &str) -> Result<(), AdminError>;

    /// Remove `member` from the replica set configuration through `primary`. Idempotent.
    async fn remove_member(&self, cluster: &ClusterKey, replset: &str, primary: &str, member: &str) -> Result<(), AdminError>;

    /// Ask `primary` to step down so another member is elected
    async fn step_down(&self, cluster: &ClusterKey, replset: &str, primary: &str) -> Result<(), AdminError>;

    /// Liveness of a query router
    async fn router_ping(&self, cluster: &ClusterKey, router: &str) -> Result<(), AdminError>;

    /// Register a shard replica set with the routers. Idempotent.
    async fn add_shard(&self, cluster: &ClusterKey, router: &str, replset: &str, members: &[String]) -> Result<(), AdminError>;

    /// Create the user or set its password, run against `target`
    async fn upsert_user(&self, cluster: &ClusterKey, target: &str, user: &str, password: &str) -> Result<(), AdminError>;

    /// Invalidate every credential of `user` other than the most recent one
    async fn revoke_previous_credential(&self, cluster: &ClusterKey, target: &str, user: &str) -> Result<(), AdminError>;

    /// Whether the engine keeps the old credential valid while a new one is added
    fn supports_dual_credentials(&self) -> bool;
}

/// `replSetGetStatus` subset printed by [`STATUS_SCRIPT`]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStatus {
    ok: i32,
    #[serde(default)]
    set: Option<String>,
    #[serde(default)]
    code_name: Option<String>,
    #[serde(default)]
    members: Vec<RawMember>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMember {
    name: String,
    state: i32,
    health: f64,
    #[serde(default)]
    ping_ms: Option<u64>,
    #[serde(default)]
    optime_secs: Option<i64>,
}

const STATUS_SCRIPT: &str = r#"
const s = db.adminCommand({ replSetGetStatus: 1 });
print(JSON.stringify({
  ok: s.ok, set: s.set, codeName: s.codeName,
  members: (s.members || []).map(m => ({
    name: m.name, state: m.state, health: m.health,
    pingMs: m.pingMs === undefined ? null : Number(m.pingMs),
    optimeSecs: m.optimeDate ? Math.floor(m.optimeDate.getTime() / 1000) : null
  }))
}));
"#;

/// Authenticates with the credentials the container receives through its
/// environment and records in `authenticated` whether that worked
const AUTH_PRELUDE: &str = r#"
const adminDb = db.getSiblingDB('admin');
let authenticated = false;
try {
  authenticated = adminDb.auth(process.env.MONGODB_CLUSTER_ADMIN_USER, process.env.MONGODB_CLUSTER_ADMIN_PASSWORD).ok === 1;
} catch (e) {}
"#;

const BOOTSTRAP_ADMIN_SCRIPT: &str = r#"
if (authenticated) {
  print(JSON.stringify({ ok: 1 }));
} else if (!db.hello().isWritablePrimary) {
  print(JSON.stringify({ ok: 0, errmsg: 'not primary' }));
} else {
  print(JSON.stringify(adminDb.runCommand({
    createUser: process.env.MONGODB_CLUSTER_ADMIN_USER,
    pwd: process.env.MONGODB_CLUSTER_ADMIN_PASSWORD,
    roles: ['root']
  })));
}
"#;

/// [`DatabaseAdmin`] backed by `mongosh` executed in the member pods
#[derive(Clone)]
pub struct MongoshAdmin {
    exec: PodExec,
}

impl MongoshAdmin {
    pub fn new(client: Client) -> Self {
        Self {
            exec: PodExec::new(client, MONGOD_CONTAINER),
        }
    }

    /// Run a script over the local connection, authenticated as the cluster admin
    /// when that user exists
    async fn eval(&self, cluster: &ClusterKey, pod: &str, script: &str) -> Result<String, AdminError> {
        let script = format!("{}\n{}", AUTH_PRELUDE, script);
        let command = format!("mongosh --quiet --norc --eval '{}'", script.replace('\'', "'\\''"));
        debug!(pod, "Running admin command");
        Ok(self.exec.run(&cluster.namespace, pod, &["sh", "-c", &command]).await?)
    }

    /// Run a command that prints `{ ok: 1 }` on success
    async fn command(&self, cluster: &ClusterKey, pod: &str, script: &str) -> Result<(), AdminError> {
        let output = self.eval(cluster, pod, script).await?;
        let value: serde_json::Value = serde_json::from_str(output.trim()).map_err(|e| AdminError::Parse {
            pod: pod.to_string(),
            message: e.to_string(),
        })?;
        if value.get("ok").and_then(serde_json::Value::as_f64) == Some(1.0) {
            Ok(())
        } else {
            Err(AdminError::Command {
                pod: pod.to_string(),
                message: value
                    .get("errmsg")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        }
    }
}

/// Quote a string as a JavaScript literal
fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Pod name from a `host:port` member name
fn pod_of(host: &str) -> String {
    host.split(['.', ':']).next().unwrap_or(host).to_string()
}

fn parse_status(pod: &str, output: &str) -> Result<ReplSetStatus, AdminError> {
    let raw: RawStatus = serde_json::from_str(output.trim()).map_err(|e| AdminError::Parse {
        pod: pod.to_string(),
        message: e.to_string(),
    })?;

    if raw.ok != 1 {
        // 94 NotYetInitialized
        if raw.code_name.as_deref() == Some("NotYetInitialized") {
            return Ok(ReplSetStatus::uninitialized());
        }
        return Err(AdminError::Command {
            pod: pod.to_string(),
            message: raw.code_name.unwrap_or_else(|| "replSetGetStatus failed".to_string()),
        });
    }

    Ok(ReplSetStatus {
        set_name: raw.set.unwrap_or_default(),
        initialized: true,
        members: raw
            .members
            .into_iter()
            .map(|m| MemberStatus {
                pod: pod_of(&m.name),
                state: MemberState::from_code(m.state),
                healthy: m.health >= 1.0,
                ping_ms: m.ping_ms,
                optime: m.optime_secs,
            })
            .collect(),
    })
}

#[async_trait]
impl DatabaseAdmin for MongoshAdmin {
    async fn replset_status(&self, cluster: &ClusterKey, _replset: &str, pod: &str) -> Result<ReplSetStatus, AdminError> {
        let output = self.eval(cluster, pod, STATUS_SCRIPT).await?;
        parse_status(pod, &output)
    }

    async fn bootstrap_admin(&self, cluster: &ClusterKey, replset: &str, primary: &str) -> Result<(), AdminError> {
        debug!(replset, primary, "Ensuring the cluster admin user");
        self.command(cluster, primary, BOOTSTRAP_ADMIN_SCRIPT).await
    }

    async fn initiate(&self, cluster: &ClusterKey, replset: &str, pod: &str, config_server: bool) -> Result<(), AdminError> {
        let host = cluster.member_host(replset, pod);
        let script = format!(
            "print(JSON.stringify(db.adminCommand({{ replSetInitiate: {{ _id: {}, configsvr: {}, members: [{{ _id: 0, host: {} }}] }} }})))",
            js(replset),
            config_server,
            js(&host)
        );
        match self.command(cluster, pod, &script).await {
            Err(AdminError::Command { message, .. }) if message.contains("already initialized") => Ok(()),
            other => other,
        }
    }

    async fn add_member(&self, cluster: &ClusterKey, replset: &str, primary: &str, member: &str) -> Result<(), AdminError> {
        let host = cluster.member_host(replset, member);
        let script = format!(
            "const h = {h}; const c = rs.conf(); \
             if (c.members.some(m => m.host === h)) {{ print(JSON.stringify({{ ok: 1 }})) }} \
             else {{ print(JSON.stringify(rs.add({{ host: h }}))) }}",
            h = js(&host)
        );
        self.command(cluster, primary, &script).await
    }

    async fn remove_member(&self, cluster: &ClusterKey, replset: &str, primary: &str, member: &str) -> Result<(), AdminError> {
        let host = cluster.member_host(replset, member);
        let script = format!(
            "const h = {h}; const c = rs.conf(); \
             if (!c.members.some(m => m.host === h)) {{ print(JSON.stringify({{ ok: 1 }})) }} \
             else {{ print(JSON.stringify(rs.remove(h))) }}",
            h = js(&host)
        );
        self.command(cluster, primary, &script).await
    }

    async fn step_down(&self, cluster: &ClusterKey, _replset: &str, primary: &str) -> Result<(), AdminError> {
        let script = "try { print(JSON.stringify(db.adminCommand({ replSetStepDown: 60 }))) } \
                      catch (e) { print(JSON.stringify({ ok: 1 })) }";
        self.command(cluster, primary, script).await
    }

    async fn router_ping(&self, cluster: &ClusterKey, router: &str) -> Result<(), AdminError> {
        self.command(cluster, router, "print(JSON.stringify(db.adminCommand({ ping: 1 })))")
            .await
    }

    async fn add_shard(&self, cluster: &ClusterKey, router: &str, replset: &str, members: &[String]) -> Result<(), AdminError> {
        let hosts: Vec<String> = members.iter().map(|m| cluster.member_host(replset, m)).collect();
        let seed = format!("{}/{}", replset, hosts.join(","));
        let script = format!(
            "print(JSON.stringify(db.adminCommand({{ addShard: {}, name: {} }})))",
            js(&seed),
            js(replset)
        );
        self.command(cluster, router, &script).await
    }

    async fn upsert_user(&self, cluster: &ClusterKey, target: &str, user: &str, password: &str) -> Result<(), AdminError> {
        let script = format!(
            "const u = {u}; const p = {p}; \
             if (adminDb.getUser(u)) {{ adminDb.changeUserPassword(u, p); print(JSON.stringify({{ ok: 1 }})) }} \
             else {{ print(JSON.stringify(adminDb.runCommand({{ createUser: u, pwd: p, roles: ['readWriteAnyDatabase'] }}))) }}",
            u = js(user),
            p = js(password)
        );
        self.command(cluster, target, &script).await
    }

    async fn revoke_previous_credential(&self, _cluster: &ClusterKey, _target: &str, _user: &str) -> Result<(), AdminError> {
        // changeUserPassword already replaced the only credential
        Ok(())
    }

    fn supports_dual_credentials(&self) -> bool {
        false
    }
}
