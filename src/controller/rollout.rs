//! Rollout controller
//!
//! Converts the topology diff of one member set into single-member actions and
//! applies them one per pass, gated by member health:
//!
//! ```text
//! Stable -> Planning -> Mutating -> Verifying -> Planning ... -> Stable
//!                          |            |
//!                          +--> Error <-+   (quorum risk, verification stalled)
//! ```
//!
//! The state lives in the cluster status, so every pass resumes where the previous
//! one stopped. [`step`] is pure: it decides what to do next and returns the new
//! state. [`execute`] carries out that decision against the collaborators.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::controller::context::Collaborators;
use crate::controller::error::{Error, Result, bounded};
use crate::controller::member_health::{HealthReport, MemberHealth};
use crate::controller::topology::{DesiredSet, MemberId, ObservedMember, SetDiff, SetRole};
use crate::crd::{MongoCluster, RolloutAction, RolloutPhase, RolloutState, UpdateStrategy};
use crate::resources::common::ClusterKey;
use crate::resources::workload::MemberTemplate;

/// Everything one rollout step looks at
#[derive(Clone, Debug)]
pub struct RolloutInput<'a> {
    /// Cluster name, used to derive member pod names
    pub cluster: &'a str,
    pub set: &'a DesiredSet,
    pub diff: &'a SetDiff,
    pub health: &'a HealthReport,
    pub observed: &'a [ObservedMember],
    pub strategy: UpdateStrategy,
    /// Spec generation of this pass
    pub generation: i64,
    /// Isolated by a restore: no mutations at all
    pub paused: bool,
    /// Held back by another set (sharded ordering), with the reason
    pub blocked: Option<String>,
    pub max_verify_passes: u32,
    /// An earlier pass saw the replica set initialized
    pub ever_initialized: bool,
}

impl RolloutInput<'_> {
    fn pod(&self, id: &MemberId) -> String {
        id.pod_name(self.cluster)
    }

    fn observed_member(&self, pod: &str) -> Option<&ObservedMember> {
        self.observed.iter().find(|m| self.pod(&m.id) == pod)
    }

    fn workload_ready(&self, pod: &str) -> bool {
        self.observed_member(pod)
            .is_some_and(|m| m.ready && !m.terminating)
    }

    /// Unreachable although its workload claims to be ready: the real state is unknown
    fn state_unknown(&self, pod: &str) -> bool {
        self.health.health(pod) == MemberHealth::Unreachable && self.workload_ready(pod)
    }

    fn is_replica_set(&self) -> bool {
        self.set.role.is_replica_set()
    }

    /// The configuration was not read this pass although it may list members
    fn membership_unknown(&self) -> bool {
        self.is_replica_set() && !self.health.config_observed() && (self.ever_initialized || !self.health.reachable)
    }

    /// The member a never-initialized replica set is initiated on: ordinal 0, and
    /// only once it answered itself that it belongs to no replica set
    fn initiator(&self) -> Option<String> {
        if !self.is_replica_set() || self.ever_initialized || !self.health.reachable || self.health.initialized {
            return None;
        }
        let first = self.pod(&MemberId::new(&self.set.name, 0));
        (self.workload_ready(&first) && self.health.uninitialized_members.contains(&first)).then_some(first)
    }

    /// Why `action` cannot run while the membership is unknown
    fn membership_deferral(&self, action: &RolloutAction) -> Option<String> {
        if !self.membership_unknown() {
            return None;
        }
        let deferred = match action {
            RolloutAction::Create(_) => false,
            RolloutAction::Delete(_) => true,
            RolloutAction::UpdateInPlace(_) | RolloutAction::Restart(_) => self.ever_initialized,
        };
        deferred.then(|| {
            format!(
                "deferring {}: configuration of replica set {} could not be read",
                action, self.set.name
            )
        })
    }
}

/// Why a rollout stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutFailure {
    /// The next action would leave the set below quorum
    QuorumRisk(String),
    /// The current action never verified
    Stalled(String),
}

impl std::fmt::Display for RolloutFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutFailure::QuorumRisk(msg) => write!(f, "quorum risk: {}", msg),
            RolloutFailure::Stalled(msg) => write!(f, "rollout stalled: {}", msg),
        }
    }
}

/// What the current pass should do for one set
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RolloutDecision {
    /// Nothing to do
    Idle,
    /// In progress, nothing to issue this pass
    Wait(String),
    /// Initiate the replica set on this member
    Initiate(String),
    /// Add this running member to the replica set configuration
    Admit(String),
    /// Apply one member action
    Mutate(RolloutAction),
    /// The rollout entered Error this pass
    Fail(RolloutFailure),
    /// The rollout is in Error and waits for a new spec generation
    Halted(String),
}

impl RolloutDecision {
    /// Whether the decision issues a mutation
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RolloutDecision::Initiate(_) | RolloutDecision::Admit(_) | RolloutDecision::Mutate(_)
        )
    }
}

enum Verification {
    Done,
    Pending(String),
    Initiate(String),
    Admit(String),
}

/// Order the diff of one set into single-member actions.
///
/// Removals come first (highest ordinal first, members in unknown state last),
/// then creations in ascending ordinal, then updates in strategy order, then
/// pending restarts.
pub fn build_plan(input: &RolloutInput<'_>, pending_restarts: &[String]) -> Vec<RolloutAction> {
    let mut plan = Vec::new();

    let (deferred, removable): (Vec<String>, Vec<String>) = input
        .diff
        .remove
        .iter()
        .map(|id| input.pod(id))
        .partition(|pod| input.state_unknown(pod));
    plan.extend(removable.into_iter().map(RolloutAction::Delete));
    plan.extend(deferred.into_iter().map(RolloutAction::Delete));

    plan.extend(input.diff.add.iter().map(|id| RolloutAction::Create(input.pod(id))));

    let mut updates: Vec<(i32, String)> = input
        .diff
        .update
        .iter()
        .map(|id| (id.ordinal, input.pod(id)))
        .collect();
    match input.strategy {
        UpdateStrategy::Manual => updates.clear(),
        UpdateStrategy::RollingUpdate => updates.sort_by(|a, b| b.0.cmp(&a.0)),
        UpdateStrategy::SmartUpdate => smart_order(input, &mut updates),
    }
    let updated: Vec<String> = input.diff.update.iter().map(|id| input.pod(id)).collect();
    plan.extend(updates.into_iter().map(|(_, pod)| RolloutAction::UpdateInPlace(pod)));

    // An update restarts the member anyway
    let removed: Vec<String> = input.diff.remove.iter().map(|id| input.pod(id)).collect();
    let mut restarts: Vec<(i32, String)> = input
        .observed
        .iter()
        .map(|m| (m.id.ordinal, input.pod(&m.id)))
        .filter(|(_, pod)| pending_restarts.contains(pod))
        .filter(|(_, pod)| !updated.contains(pod) && !removed.contains(pod))
        .collect();
    smart_order(input, &mut restarts);
    plan.extend(restarts.into_iter().map(|(_, pod)| RolloutAction::Restart(pod)));

    plan
}

/// Secondaries first, then members that cannot be reached, the primary last
fn smart_order(input: &RolloutInput<'_>, members: &mut [(i32, String)]) {
    members.sort_by_key(|(ordinal, pod)| {
        let rank = if input.health.primary.as_deref() == Some(pod.as_str()) {
            2
        } else if input.health.health(pod) == MemberHealth::Unreachable {
            1
        } else {
            0
        };
        (rank, *ordinal)
    });
}

fn verify(input: &RolloutInput<'_>, action: &RolloutAction) -> Verification {
    let health = input.health;
    let pod = action.member();

    if !input.is_replica_set() {
        return match action {
            RolloutAction::Delete(_) if input.observed_member(pod).is_none() => Verification::Done,
            RolloutAction::Delete(_) => Verification::Pending(format!("waiting for {} to terminate", pod)),
            _ if health.health(pod) == MemberHealth::Healthy => Verification::Done,
            _ => Verification::Pending(format!("waiting for router {} to become healthy", pod)),
        };
    }

    match action {
        RolloutAction::Delete(_) => {
            if input.observed_member(pod).is_some() {
                Verification::Pending(format!("waiting for {} to terminate", pod))
            } else if !health.reachable || health.in_config(pod) {
                Verification::Pending(format!("waiting for {} to leave the replica set", pod))
            } else {
                Verification::Done
            }
        }
        RolloutAction::Create(_) => {
            if !input.workload_ready(pod) {
                Verification::Pending(format!("waiting for {} to start", pod))
            } else if !health.reachable {
                Verification::Pending(format!("waiting for replica set {} to answer", input.set.name))
            } else if !health.initialized {
                match input.initiator() {
                    Some(first) => Verification::Initiate(first),
                    None => Verification::Pending(format!(
                        "waiting for replica set {} to report its configuration",
                        input.set.name
                    )),
                }
            } else if !health.in_config(pod) {
                if health.primary.is_some() {
                    Verification::Admit(pod.to_string())
                } else {
                    Verification::Pending(format!("waiting for a primary to admit {}", pod))
                }
            } else if health.health(pod) == MemberHealth::Healthy && health.has_quorum() {
                Verification::Done
            } else {
                Verification::Pending(format!("waiting for {} to finish initial sync", pod))
            }
        }
        RolloutAction::UpdateInPlace(_) | RolloutAction::Restart(_) => {
            let member_ok = match input.strategy {
                UpdateStrategy::RollingUpdate => input.workload_ready(pod),
                _ => health.health(pod) == MemberHealth::Healthy,
            };
            if member_ok && health.has_quorum() {
                Verification::Done
            } else {
                Verification::Pending(format!("waiting for {} to become healthy", pod))
            }
        }
    }
}

/// Whether the head action can run without dropping the set below quorum
fn quorum_safe(input: &RolloutInput<'_>, action: &RolloutAction) -> bool {
    let health = input.health;
    let pod = action.member();

    if !input.is_replica_set() {
        // Routers are stateless; keep one serving while another is replaced
        return match action {
            RolloutAction::Create(_) | RolloutAction::Delete(_) => true,
            _ => input.set.size <= 1 || health.healthy_count() > usize::from(health.health(pod) == MemberHealth::Healthy),
        };
    }
    if !health.config_observed() {
        // Only reached when nothing was ever configured
        return matches!(action, RolloutAction::Create(_)) || !input.ever_initialized;
    }

    match action {
        RolloutAction::Create(_) => true,
        RolloutAction::Delete(_) => health.is_removal_safe(pod),
        RolloutAction::UpdateInPlace(_) | RolloutAction::Restart(_) => {
            // A single-member set cannot stay available through a restart
            health.voting_size() <= 1 || health.is_rollout_safe(pod)
        }
    }
}

fn enter_error(state: &mut RolloutState, generation: i64, failure: &RolloutFailure) {
    state.phase = RolloutPhase::Error;
    state.error_generation = Some(generation);
    state.message = Some(failure.to_string());
}

/// Advance the rollout of one set by at most one decision.
pub fn step(state: &RolloutState, input: &RolloutInput<'_>) -> (RolloutState, RolloutDecision) {
    let mut next = state.clone();
    next.pending_restarts
        .retain(|pod| input.observed_member(pod).is_some());

    if next.phase == RolloutPhase::Error {
        let cleared = next.error_generation.is_some_and(|g| input.generation > g);
        if !cleared {
            let reason = next.message.clone().unwrap_or_else(|| "rollout halted".to_string());
            return (next, RolloutDecision::Halted(reason));
        }
        info!(replset = %input.set.name, generation = input.generation, "Spec changed, resuming rollout after error");
        next.phase = RolloutPhase::Planning;
        next.current = None;
        next.stalled_passes = 0;
        next.error_generation = None;
        next.message = None;
    }

    if next.phase == RolloutPhase::Verifying {
        let Some(action) = next.current.clone() else {
            next.phase = RolloutPhase::Planning;
            return plan_next(next, input);
        };
        match verify(input, &action) {
            Verification::Done => {
                debug!(replset = %input.set.name, %action, "Rollout action verified");
                if let RolloutAction::Restart(pod) = &action {
                    next.pending_restarts.retain(|p| p != pod);
                }
                next.current = None;
                next.stalled_passes = 0;
                next.message = None;
                next.phase = RolloutPhase::Planning;
            }
            Verification::Initiate(pod) => {
                next.stalled_passes = 0;
                return (next, RolloutDecision::Initiate(pod));
            }
            Verification::Admit(pod) => {
                next.stalled_passes = 0;
                return (next, RolloutDecision::Admit(pod));
            }
            Verification::Pending(reason) => {
                next.stalled_passes += 1;
                if next.stalled_passes > input.max_verify_passes {
                    let failure = RolloutFailure::Stalled(format!(
                        "{} not verified after {} passes: {}",
                        action, input.max_verify_passes, reason
                    ));
                    enter_error(&mut next, input.generation, &failure);
                    return (next, RolloutDecision::Fail(failure));
                }
                next.message = Some(reason.clone());
                return (next, RolloutDecision::Wait(reason));
            }
        }
    }

    plan_next(next, input)
}

fn plan_next(mut next: RolloutState, input: &RolloutInput<'_>) -> (RolloutState, RolloutDecision) {
    let plan = build_plan(input, &next.pending_restarts);

    if next.phase == RolloutPhase::Mutating {
        // The previous attempt did not complete; re-issue it while it is still wanted
        if let Some(current) = next.current.clone()
            && plan.contains(&current)
        {
            if input.paused {
                return (next, RolloutDecision::Wait("paused for restore".to_string()));
            }
            if let Some(reason) = input.membership_deferral(&current) {
                next.message = Some(reason.clone());
                return (next, RolloutDecision::Wait(reason));
            }
            next.plan = plan.into_iter().filter(|a| *a != current).collect();
            return (next, RolloutDecision::Mutate(current));
        }
        next.current = None;
    }

    if !input.paused
        && let Some(first) = input.initiator()
    {
        next.phase = RolloutPhase::Planning;
        next.plan = plan;
        return (next, RolloutDecision::Initiate(first));
    }

    // A desired member running outside the configuration, e.g. after its creation
    // was abandoned by an earlier error
    if input.is_replica_set()
        && input.health.initialized
        && input.health.primary.is_some()
        && !input.paused
        && input.blocked.is_none()
        && let Some(stray) = input
            .observed
            .iter()
            .filter(|m| m.ready && !m.terminating && m.id.ordinal < input.set.size)
            .map(|m| input.pod(&m.id))
            .find(|pod| !input.health.in_config(pod))
    {
        next.phase = RolloutPhase::Planning;
        next.plan = plan;
        return (next, RolloutDecision::Admit(stray));
    }

    let Some(head) = plan.first().cloned() else {
        next.phase = RolloutPhase::Stable;
        next.plan = Vec::new();
        next.current = None;
        next.stalled_passes = 0;
        next.message = (input.strategy == UpdateStrategy::Manual && !input.diff.update.is_empty())
            .then(|| format!("{} members pending manual update", input.diff.update.len()));
        return (next, RolloutDecision::Idle);
    };

    next.phase = RolloutPhase::Planning;
    next.plan = plan.clone();

    if input.paused {
        return (next, RolloutDecision::Wait("paused for restore".to_string()));
    }
    if let Some(reason) = input.blocked.clone() {
        next.message = Some(reason.clone());
        return (next, RolloutDecision::Wait(reason));
    }
    if input.state_unknown(head.member()) {
        let reason = format!("deferring {}: member state unknown", head);
        next.message = Some(reason.clone());
        return (next, RolloutDecision::Wait(reason));
    }
    if let Some(reason) = input.membership_deferral(&head) {
        next.message = Some(reason.clone());
        return (next, RolloutDecision::Wait(reason));
    }
    if !quorum_safe(input, &head) {
        let failure = RolloutFailure::QuorumRisk(format!(
            "{} would leave replica set {} without a healthy majority ({} of {} healthy)",
            head,
            input.set.name,
            input.health.healthy_count(),
            input.health.voting_size()
        ));
        enter_error(&mut next, input.generation, &failure);
        return (next, RolloutDecision::Fail(failure));
    }

    next.phase = RolloutPhase::Mutating;
    next.current = Some(head.clone());
    next.plan = plan.into_iter().skip(1).collect();
    next.stalled_passes = 0;
    next.message = Some(format!("applying {}", head));
    (next, RolloutDecision::Mutate(head))
}

/// Outcome of executing a decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Execution {
    Applied,
    /// A preparatory step ran (primary step-down); the action is re-issued next pass
    Pending(String),
}

/// Where a decision is executed
pub struct RolloutTarget<'a> {
    pub cluster: &'a MongoCluster,
    pub key: &'a ClusterKey,
    pub set: &'a DesiredSet,
    pub health: &'a HealthReport,
    /// Config server connection string, handed to router workloads
    pub config_db: Option<String>,
}

impl RolloutTarget<'_> {
    fn member_id(&self, pod: &str) -> Result<MemberId> {
        MemberId::from_pod_name(&self.key.name, &self.set.name, pod)
            .ok_or_else(|| Error::ValidationError(format!("{} is not a member of {}", pod, self.set.name)))
    }

    fn primary(&self) -> Result<&str> {
        self.health.primary.as_deref().ok_or_else(|| {
            Error::TransientError(format!("replica set {} has no primary", self.set.name))
        })
    }

    /// Whether `pod` must hand over the primary role before it goes down
    fn must_step_down(&self, pod: &str) -> bool {
        self.set.role.is_replica_set()
            && self.health.primary.as_deref() == Some(pod)
            && self.health.voting_size() > 1
    }
}

/// Execute a mutating decision. Non-mutating decisions are a no-op.
pub async fn execute(
    collaborators: &Collaborators,
    timeout: Duration,
    target: &RolloutTarget<'_>,
    decision: &RolloutDecision,
) -> Result<Execution> {
    let platform = collaborators.platform.as_ref();
    let admin = collaborators.admin.as_ref();
    let replset = target.set.name.as_str();
    let key = target.key;

    match decision {
        RolloutDecision::Initiate(pod) => {
            info!(cluster = %key, replset, member = %pod, "Initiating replica set");
            let config_server = target.set.role == SetRole::ConfigServer;
            bounded(timeout, "replica set initiation", admin.initiate(key, replset, pod, config_server)).await?;
            Ok(Execution::Applied)
        }
        RolloutDecision::Admit(pod) => {
            let primary = target.primary()?;
            info!(cluster = %key, replset, member = %pod, "Adding member to replica set");
            bounded(timeout, "member admission", admin.add_member(key, replset, primary, pod)).await?;
            Ok(Execution::Applied)
        }
        RolloutDecision::Mutate(action) => {
            let pod = action.member();
            let id = target.member_id(pod)?;
            info!(cluster = %key, replset, %action, "Applying rollout action");

            match action {
                RolloutAction::Create(_) => {
                    let template = MemberTemplate::new(target.set, id, target.config_db.clone());
                    bounded(timeout, "member create", platform.create_member(target.cluster, &template)).await?;
                }
                RolloutAction::Delete(_) => {
                    // The database side lets go of the member before its workload does
                    if target.set.role.is_replica_set() && !target.health.reachable {
                        return Err(Error::TransientError(format!(
                            "configuration of replica set {} unknown, not deleting {}",
                            replset, pod
                        )));
                    }
                    if target.set.role.is_replica_set() && target.health.in_config(pod) {
                        if target.must_step_down(pod) {
                            bounded(timeout, "primary step-down", admin.step_down(key, replset, pod)).await?;
                            return Ok(Execution::Pending(format!("stepped down {} before removal", pod)));
                        }
                        let primary = target.primary()?;
                        bounded(timeout, "member removal", admin.remove_member(key, replset, primary, pod)).await?;
                    }
                    bounded(timeout, "member delete", platform.delete_member(target.cluster, &id)).await?;
                }
                RolloutAction::UpdateInPlace(_) | RolloutAction::Restart(_) => {
                    if target.must_step_down(pod) {
                        bounded(timeout, "primary step-down", admin.step_down(key, replset, pod)).await?;
                        return Ok(Execution::Pending(format!("stepped down {} before {}", pod, action)));
                    }
                    if matches!(action, RolloutAction::UpdateInPlace(_)) {
                        let template = MemberTemplate::new(target.set, id, target.config_db.clone());
                        bounded(timeout, "member update", platform.update_member(target.cluster, &template)).await?;
                    } else {
                        bounded(timeout, "member restart", platform.restart_member(target.cluster, &id)).await?;
                    }
                }
            }
            Ok(Execution::Applied)
        }
        _ => Ok(Execution::Applied),
    }
}

/// Fold the result of [`execute`] back into the rollout state
pub fn record_execution(state: &mut RolloutState, decision: &RolloutDecision, result: &Result<Execution>) {
    match (decision, result) {
        (RolloutDecision::Mutate(_), Ok(Execution::Applied)) => {
            state.phase = RolloutPhase::Verifying;
            state.stalled_passes = 0;
        }
        (RolloutDecision::Initiate(pod), Ok(_)) => {
            state.message = Some(format!("initiated replica set on {}", pod));
        }
        (RolloutDecision::Admit(pod), Ok(_)) => {
            state.message = Some(format!("added {} to the replica set", pod));
        }
        (_, Ok(Execution::Pending(msg))) => {
            state.message = Some(msg.clone());
        }
        (_, Err(e)) => {
            warn!(error = %e, "Rollout action failed, retrying next pass");
            state.message = Some(format!("retrying after error: {}", e));
        }
        _ => {}
    }
}
