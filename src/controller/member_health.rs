//! Member health checks
//!
//! A replica set is checked by asking any reachable member for the replica set
//! status, ready members first. The answer classifies every observed member.
//! Failed health queries never fail the pass: members nobody could report on are
//! Unreachable, which makes the rollout defer actions on them.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::controller::topology::{ObservedMember, quorum};
use crate::resources::admin::{DatabaseAdmin, MemberState, ReplSetStatus};
use crate::resources::common::ClusterKey;

/// Health classification of one member
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberHealth {
    /// Primary or secondary, reachable and in sync
    Healthy,
    /// Starting, syncing or not yet part of the replica set
    Initializing,
    /// Could not be reached or reported down
    Unreachable,
    /// Reports a role it should not have (arbiter, removed, foreign replica set)
    RoleMismatch,
}

impl std::fmt::Display for MemberHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberHealth::Healthy => write!(f, "Healthy"),
            MemberHealth::Initializing => write!(f, "Initializing"),
            MemberHealth::Unreachable => write!(f, "Unreachable"),
            MemberHealth::RoleMismatch => write!(f, "RoleMismatch"),
        }
    }
}

/// Health of one member as reported by the set
#[derive(Clone, Debug, PartialEq)]
pub struct MemberReport {
    pub health: MemberHealth,
    pub state: Option<MemberState>,
    pub ping_ms: Option<u64>,
    pub optime: Option<i64>,
}

impl MemberReport {
    fn with_health(health: MemberHealth) -> Self {
        Self {
            health,
            state: None,
            ping_ms: None,
            optime: None,
        }
    }
}

/// Health of one replica set, keyed by member pod name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HealthReport {
    pub replset: String,
    /// Some member answered the status query
    pub reachable: bool,
    pub initialized: bool,
    pub primary: Option<String>,
    pub members: BTreeMap<String, MemberReport>,
    /// Members present in the replica set configuration
    pub config_members: Vec<String>,
    /// Members that answered they belong to no replica set
    pub uninitialized_members: Vec<String>,
}

impl HealthReport {
    pub fn health(&self, pod: &str) -> MemberHealth {
        self.members
            .get(pod)
            .map(|m| m.health)
            .unwrap_or(MemberHealth::Unreachable)
    }

    pub fn healthy_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.health == MemberHealth::Healthy)
            .count()
    }

    /// Number of voting members quorum is computed against
    pub fn voting_size(&self) -> usize {
        if self.initialized && !self.config_members.is_empty() {
            self.config_members.len()
        } else {
            self.members.len()
        }
    }

    pub fn in_config(&self, pod: &str) -> bool {
        self.config_members.iter().any(|m| m == pod)
    }

    /// Whether the replica set configuration was read this pass
    pub fn config_observed(&self) -> bool {
        self.reachable && self.initialized
    }

    /// Whether `pod` can be taken down: the Healthy members other than it
    /// still form a majority of the current membership
    pub fn is_rollout_safe(&self, pod: &str) -> bool {
        let others = self
            .members
            .iter()
            .filter(|(name, m)| name.as_str() != pod && m.health == MemberHealth::Healthy)
            .count();
        others >= quorum(self.voting_size())
    }

    /// Whether `pod` can leave the replica set: the Healthy members other than it
    /// form a majority of the membership that remains
    pub fn is_removal_safe(&self, pod: &str) -> bool {
        let remaining = if self.in_config(pod) {
            self.voting_size().saturating_sub(1)
        } else {
            self.voting_size()
        };
        let others = self
            .members
            .iter()
            .filter(|(name, m)| name.as_str() != pod && m.health == MemberHealth::Healthy)
            .count();
        others >= quorum(remaining)
    }

    /// Healthy majority with an elected primary
    pub fn has_quorum(&self) -> bool {
        self.primary.is_some() && self.healthy_count() >= quorum(self.voting_size())
    }
}

/// Health of the router tier, keyed by router pod name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouterHealth {
    pub members: BTreeMap<String, MemberHealth>,
}

impl RouterHealth {
    pub fn healthy_count(&self) -> usize {
        self.members
            .values()
            .filter(|h| **h == MemberHealth::Healthy)
            .count()
    }

    /// Any Healthy router, used as the entry point for cluster-wide commands
    pub fn any_healthy(&self) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, h)| **h == MemberHealth::Healthy)
            .map(|(name, _)| name.as_str())
    }

    /// View the routers as a member set so the rollout can treat them uniformly
    pub fn to_report(&self, name: &str) -> HealthReport {
        HealthReport {
            replset: name.to_string(),
            reachable: true,
            initialized: true,
            primary: None,
            members: self
                .members
                .iter()
                .map(|(pod, h)| (pod.clone(), MemberReport::with_health(*h)))
                .collect(),
            config_members: Vec::new(),
            uninitialized_members: Vec::new(),
        }
    }
}

fn classify(status: &ReplSetStatus, member: &ObservedMember, pod: &str) -> MemberReport {
    if member.terminating {
        return MemberReport::with_health(MemberHealth::Unreachable);
    }

    let Some(entry) = status.members.iter().find(|m| m.pod == pod) else {
        // Running but not (yet) part of the replica set
        let health = if member.ready {
            MemberHealth::Initializing
        } else {
            MemberHealth::Unreachable
        };
        return MemberReport::with_health(health);
    };

    let health = match entry.state {
        MemberState::Primary | MemberState::Secondary if entry.healthy => MemberHealth::Healthy,
        MemberState::Startup | MemberState::Recovering if entry.healthy => MemberHealth::Initializing,
        MemberState::Arbiter | MemberState::Removed => MemberHealth::RoleMismatch,
        _ => MemberHealth::Unreachable,
    };

    MemberReport {
        health,
        state: Some(entry.state),
        ping_ms: entry.ping_ms,
        optime: entry.optime,
    }
}

/// Check one replica set.
///
/// Members are asked in turn (ready first) until one answers with the configuration
/// within `timeout`. A member that is not part of any configuration, such as one
/// created but not yet admitted, answers "uninitialized"; that answer only stands
/// when no other member reports the configuration.
pub async fn inspect(
    admin: &dyn DatabaseAdmin,
    cluster: &ClusterKey,
    replset: &str,
    members: &[ObservedMember],
    timeout: Duration,
) -> HealthReport {
    let pod_of = |m: &ObservedMember| m.id.pod_name(&cluster.name);

    let mut candidates: Vec<&ObservedMember> = members.iter().filter(|m| !m.terminating).collect();
    candidates.sort_by_key(|m| (!m.ready, m.id.ordinal));

    let mut report = HealthReport {
        replset: replset.to_string(),
        ..Default::default()
    };
    let mut mismatched: Vec<String> = Vec::new();
    let mut answer: Option<ReplSetStatus> = None;

    for candidate in candidates {
        let pod = pod_of(candidate);
        let status = match tokio::time::timeout(timeout, admin.replset_status(cluster, replset, &pod)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                debug!(replset, member = %pod, error = %e, "Replica set status query failed");
                continue;
            }
            Err(_) => {
                debug!(replset, member = %pod, "Replica set status query timed out");
                continue;
            }
        };

        if !status.initialized {
            report.uninitialized_members.push(pod);
            continue;
        }
        if status.set_name != replset {
            warn!(replset, member = %pod, reported = %status.set_name, "Member belongs to another replica set");
            mismatched.push(pod);
            continue;
        }
        answer = Some(status);
        break;
    }

    let status = match answer {
        Some(status) => Some(status),
        None if !report.uninitialized_members.is_empty() => Some(ReplSetStatus::uninitialized()),
        None => None,
    };
    match status {
        Some(status) => {
            report.reachable = true;
            report.initialized = status.initialized;
            report.primary = status.primary().map(|p| p.pod.clone());
            report.config_members = status.members.iter().map(|m| m.pod.clone()).collect();
            report.members = members
                .iter()
                .map(|m| {
                    let pod = pod_of(m);
                    let r = classify(&status, m, &pod);
                    (pod, r)
                })
                .collect();
        }
        None => {
            report.members = members
                .iter()
                .map(|m| (pod_of(m), MemberReport::with_health(MemberHealth::Unreachable)))
                .collect();
        }
    }
    for pod in mismatched {
        report
            .members
            .insert(pod, MemberReport::with_health(MemberHealth::RoleMismatch));
    }

    report
}

/// Check every router concurrently
pub async fn inspect_routers(
    admin: &dyn DatabaseAdmin,
    cluster: &ClusterKey,
    routers: &[ObservedMember],
    timeout: Duration,
) -> RouterHealth {
    let checks = routers.iter().map(|router| async move {
        let pod = router.id.pod_name(&cluster.name);
        let health = if router.terminating {
            MemberHealth::Unreachable
        } else if !router.ready {
            MemberHealth::Initializing
        } else {
            match tokio::time::timeout(timeout, admin.router_ping(cluster, &pod)).await {
                Ok(Ok(())) => MemberHealth::Healthy,
                Ok(Err(e)) => {
                    debug!(router = %pod, error = %e, "Router ping failed");
                    MemberHealth::Unreachable
                }
                Err(_) => MemberHealth::Unreachable,
            }
        };
        (pod, health)
    });

    RouterHealth {
        members: join_all(checks).await.into_iter().collect(),
    }
}
