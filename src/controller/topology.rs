//! Cluster topology model and diffing
//!
//! The desired topology is a graph of member sets (config server, shards or
//! plain replica sets, and routers). It is kept as identifiers plus a lookup
//! table so no set holds a reference to another.
//!
//! [`compute_diff`] compares that graph against the members observed on the
//! platform. It is pure and total: anything that could not be observed is
//! treated as absent.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::controller::error::{Error, Result};
use crate::crd::{MongoClusterSpec, ReplicaSetSpec, StorageSpec};

/// Pseudo replica set name used for the router tier
pub const ROUTER_SET: &str = "mongos";

/// Majority needed to elect a primary or commit a reconfiguration
pub fn quorum(size: usize) -> usize {
    size / 2 + 1
}

/// Identity of a member: its replica set and ordinal slot
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId {
    pub replset: String,
    pub ordinal: i32,
}

impl MemberId {
    pub fn new(replset: impl Into<String>, ordinal: i32) -> Self {
        Self {
            replset: replset.into(),
            ordinal,
        }
    }

    /// Name of the member's single-replica workload: `<cluster>-<replset>-<ordinal>`
    pub fn workload_name(&self, cluster: &str) -> String {
        format!("{}-{}-{}", cluster, self.replset, self.ordinal)
    }

    /// Name of the member's pod, the only replica of its workload
    pub fn pod_name(&self, cluster: &str) -> String {
        format!("{}-0", self.workload_name(cluster))
    }

    /// Parse a pod name back into a member of the given replica set
    pub fn from_pod_name(cluster: &str, replset: &str, pod: &str) -> Option<Self> {
        let prefix = format!("{}-{}-", cluster, replset);
        let ordinal = pod
            .strip_prefix(&prefix)?
            .strip_suffix("-0")?
            .parse::<i32>()
            .ok()?;
        (ordinal >= 0).then(|| Self::new(replset, ordinal))
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.replset, self.ordinal)
    }
}

/// What a member set is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetRole {
    /// Standalone replica set (unsharded cluster)
    ReplicaSet,
    /// Data shard of a sharded cluster
    Shard,
    /// Config server replica set of a sharded cluster
    ConfigServer,
    /// Stateless query routers
    Router,
}

impl SetRole {
    /// Whether the set is a majority-reliant replica set
    pub fn is_replica_set(&self) -> bool {
        !matches!(self, SetRole::Router)
    }
}

/// Desired shape of one member set
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredSet {
    pub name: String,
    pub role: SetRole,
    pub size: i32,
    pub image: String,
    pub config_hash: String,
    pub configuration: BTreeMap<String, String>,
    pub storage: Option<StorageSpec>,
}

impl DesiredSet {
    fn from_replica_set(spec: &MongoClusterSpec, rs: &ReplicaSetSpec, role: SetRole) -> Self {
        Self {
            name: rs.name.clone(),
            role,
            size: rs.size,
            image: spec.image_for(rs),
            config_hash: config_hash(&rs.configuration, role),
            configuration: rs.configuration.clone(),
            storage: Some(rs.storage.clone()),
        }
    }

    /// Identities of the desired members, ordinals `0..size`
    pub fn members(&self) -> impl Iterator<Item = MemberId> + '_ {
        (0..self.size.max(0)).map(|i| MemberId::new(self.name.clone(), i))
    }
}

/// Desired topology as identifiers plus a lookup table
#[derive(Clone, Debug, Default)]
pub struct TopologyGraph {
    /// Config server set (sharded clusters only)
    pub config_server: Option<String>,
    /// Data-bearing sets: shards in sharded mode, replica sets otherwise
    pub data_sets: Vec<String>,
    /// Router tier (sharded clusters only)
    pub routers: Option<DesiredSet>,
    sets: BTreeMap<String, DesiredSet>,
}

impl TopologyGraph {
    pub fn set(&self, name: &str) -> Option<&DesiredSet> {
        if name == ROUTER_SET {
            return self.routers.as_ref();
        }
        self.sets.get(name)
    }

    pub fn is_sharded(&self) -> bool {
        self.config_server.is_some()
    }

    /// Replica sets in rollout order: config server first, then data sets
    pub fn replica_sets(&self) -> impl Iterator<Item = &DesiredSet> {
        self.config_server
            .iter()
            .chain(self.data_sets.iter())
            .filter_map(|name| self.sets.get(name))
    }

    /// Config server connection string handed to routers
    pub fn config_db(&self, cluster: &str, host: impl Fn(&str, &str) -> String) -> Option<String> {
        let cfg = self.sets.get(self.config_server.as_ref()?)?;
        let hosts: Vec<String> = cfg
            .members()
            .map(|m| host(&cfg.name, &m.pod_name(cluster)))
            .collect();
        Some(format!("{}/{}", cfg.name, hosts.join(",")))
    }
}

/// Build the desired topology graph from the cluster spec
pub fn desired_topology(spec: &MongoClusterSpec) -> TopologyGraph {
    let mut graph = TopologyGraph::default();

    let data_role = if spec.is_sharded() {
        SetRole::Shard
    } else {
        SetRole::ReplicaSet
    };

    if let Some(sharding) = spec.sharding.as_ref().filter(|s| s.enabled) {
        let cfg = DesiredSet::from_replica_set(spec, &sharding.config_server, SetRole::ConfigServer);
        graph.config_server = Some(cfg.name.clone());
        graph.sets.insert(cfg.name.clone(), cfg);

        let router_image = sharding
            .routers
            .image
            .clone()
            .unwrap_or_else(|| spec.image.clone());
        graph.routers = Some(DesiredSet {
            name: ROUTER_SET.to_string(),
            role: SetRole::Router,
            size: sharding.routers.size,
            image: router_image,
            config_hash: config_hash(&BTreeMap::new(), SetRole::Router),
            configuration: BTreeMap::new(),
            storage: None,
        });
    }

    for rs in &spec.replica_sets {
        let set = DesiredSet::from_replica_set(spec, rs, data_role);
        graph.data_sets.push(set.name.clone());
        graph.sets.insert(set.name.clone(), set);
    }

    graph
}

/// Fingerprint of everything other than the image that requires a member update.
/// Storage is left out: volume claims of existing members cannot change.
pub fn config_hash(configuration: &BTreeMap<String, String>, role: SetRole) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}", role).as_bytes());
    for (key, value) in configuration {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// A member workload as observed on the platform
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedMember {
    pub id: MemberId,
    pub image: String,
    pub config_hash: String,
    /// Workload converged to its latest template and the process is ready
    pub ready: bool,
    /// Workload is being deleted
    pub terminating: bool,
}

/// Snapshot of the platform state assembled at the start of a pass
#[derive(Clone, Debug, Default)]
pub struct ObservedState {
    pub members: BTreeMap<String, Vec<ObservedMember>>,
}

impl ObservedState {
    pub fn from_members(members: Vec<ObservedMember>) -> Self {
        let mut by_set: BTreeMap<String, Vec<ObservedMember>> = BTreeMap::new();
        for member in members {
            by_set.entry(member.id.replset.clone()).or_default().push(member);
        }
        for members in by_set.values_mut() {
            members.sort_by_key(|m| m.id.ordinal);
        }
        Self { members: by_set }
    }

    /// Members of one set, ordered by ordinal
    pub fn set(&self, name: &str) -> &[ObservedMember] {
        self.members.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn member(&self, id: &MemberId) -> Option<&ObservedMember> {
        self.set(&id.replset).iter().find(|m| m.id == *id)
    }
}

/// Membership changes of one set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetDiff {
    /// Missing members, ascending ordinal
    pub add: Vec<MemberId>,
    /// Surplus members, highest ordinal first
    pub remove: Vec<MemberId>,
    /// Members whose image or configuration differs, ascending ordinal
    pub update: Vec<MemberId>,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }

    /// Whether the membership itself changes
    pub fn changes_membership(&self) -> bool {
        !self.add.is_empty() || !self.remove.is_empty()
    }
}

/// Per-set differences between desired and observed state
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub sets: BTreeMap<String, SetDiff>,
}

impl TopologyDiff {
    pub fn set(&self, name: &str) -> Option<&SetDiff> {
        self.sets.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(SetDiff::is_empty)
    }
}

/// Compare the desired topology against the observed members.
///
/// Sets present on the platform but absent from the desired topology get all
/// their members listed as removals.
pub fn compute_diff(graph: &TopologyGraph, observed: &ObservedState) -> TopologyDiff {
    let mut diff = TopologyDiff::default();

    let desired_sets = graph.replica_sets().chain(graph.routers.iter());
    for desired in desired_sets {
        diff.sets
            .insert(desired.name.clone(), diff_set(desired, observed.set(&desired.name)));
    }

    for (name, members) in &observed.members {
        if diff.sets.contains_key(name) {
            continue;
        }
        let mut remove: Vec<MemberId> = members.iter().map(|m| m.id.clone()).collect();
        remove.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        diff.sets.insert(
            name.clone(),
            SetDiff {
                remove,
                ..Default::default()
            },
        );
    }

    diff
}

fn diff_set(desired: &DesiredSet, observed: &[ObservedMember]) -> SetDiff {
    let present: BTreeSet<i32> = observed.iter().map(|m| m.id.ordinal).collect();

    let add = desired
        .members()
        .filter(|m| !present.contains(&m.ordinal))
        .collect();

    let mut remove: Vec<MemberId> = observed
        .iter()
        .filter(|m| m.id.ordinal >= desired.size)
        .map(|m| m.id.clone())
        .collect();
    remove.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));

    let mut update: Vec<MemberId> = observed
        .iter()
        .filter(|m| m.id.ordinal < desired.size && !m.terminating)
        .filter(|m| m.image != desired.image || m.config_hash != desired.config_hash)
        .map(|m| m.id.clone())
        .collect();
    update.sort_by_key(|m| m.ordinal);

    SetDiff { add, remove, update }
}

/// Reject size changes that would leave a majority-reliant set below its quorum minimum.
///
/// A set that has grown beyond one member may not shrink below two. A single-member
/// set is only acceptable when the set was created that way.
pub fn check_size_change(replset: &str, current: i32, desired: i32) -> Result<()> {
    if desired < 1 {
        return Err(Error::ValidationError(format!(
            "replica set {} must have at least one member, got {}",
            replset, desired
        )));
    }
    if current > 1 && desired < 2 {
        return Err(Error::ValidationError(format!(
            "replica set {} cannot shrink from {} to {} members: minimum quorum size is 2",
            replset, current, desired
        )));
    }
    Ok(())
}
