//! Reconciliation logic for MongoCluster resources
//!
//! One pass observes the cluster, lets every component advance by at most one
//! step and publishes the result:
//!
//! 1. validate the cluster spec, list member workloads, diff against the desired topology
//! 2. check every replica set and the routers, create missing cluster admin users
//! 3. restore, backups and credential rotation
//! 4. rollouts: config server first, then shards, routers last
//! 5. shard registration, status aggregation, requeue decision
//!
//! Deletion is checked again right before anything is mutated; once it is seen the
//! pass issues nothing new.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::backup::{BackupInputs, BackupOutcome, backup_active, reconcile_backups};
use crate::controller::cleanup::{finalize, is_namespace_not_found_error};
use crate::controller::context::{Collaborators, Context, OperatorConfig};
use crate::controller::credentials::{RotationInputs, rotate_credentials};
use crate::controller::error::{Error, Result, bounded};
use crate::controller::member_health::{HealthReport, MemberHealth, RouterHealth, inspect, inspect_routers};
use crate::controller::restore::{RestoreInputs, reconcile_restore};
use crate::controller::rollout::{self, RolloutDecision, RolloutInput, RolloutTarget};
use crate::controller::status::{StatusInputs, StatusManager, aggregate};
use crate::controller::topology::{
    ObservedMember, ObservedState, ROUTER_SET, SetRole, TopologyDiff, TopologyGraph, check_size_change,
    compute_diff, desired_topology,
};
use crate::controller::validation::validate_spec;
use crate::crd::{
    BackupSpec, ClusterPhase, CredentialStatus, MongoCluster, MongoClusterStatus, ReplicaSetStatus,
    RestoreStatus, RolloutAction, RolloutPhase, RolloutState, RouterStatus,
};
use crate::resources::common::{ClusterKey, FIELD_MANAGER};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "mongodb.example.com/finalizer";

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<MongoCluster>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let key = ClusterKey::from_cluster(&cluster);
    let _pass = ctx.pass_lock(&key).await;

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx, &key).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx, &key).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    debug!("Reconciling MongoCluster");
    let outcome = run_pass(&cluster, &ctx.collaborators, &ctx.config, Utc::now()).await;
    let written = StatusManager::new(&cluster, ctx.client.clone())
        .write(&outcome.status)
        .await;
    record_metrics(&ctx, &key, &outcome, started.elapsed());

    written?;
    match outcome.error {
        Some(e) => {
            error!(phase = %outcome.status.phase, error = %e, "Reconcile pass failed");
            Err(e)
        }
        None => {
            debug!(phase = %outcome.status.phase, requeue = ?outcome.requeue, "Reconcile pass complete");
            Ok(Action::requeue(outcome.requeue))
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(cluster: Arc<MongoCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let retry_count = cluster
        .status
        .as_ref()
        .and_then(|s| s.retry_count)
        .unwrap_or(0)
        .max(0) as u32;
    let delay = ctx.config.backoff.delay_for_error(error, retry_count);

    if error.is_retryable() {
        warn!(name = %cluster.name_any(), error = %error, retry_count, ?delay, "Retryable error, requeuing");
    } else {
        error!(name = %cluster.name_any(), error = %error, ?delay, "Non-retryable error, waiting for a spec change");
    }
    if let Some(health) = &ctx.health_state {
        health
            .metrics
            .record_error(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
    }

    Action::requeue(delay)
}

fn record_metrics(ctx: &Context, key: &ClusterKey, outcome: &PassOutcome, elapsed: Duration) {
    let Some(health) = &ctx.health_state else {
        return;
    };
    let metrics = &health.metrics;
    let (ns, name) = (key.namespace.as_str(), key.name.as_str());
    metrics.record_reconcile(ns, name, elapsed.as_secs_f64());
    metrics.set_cluster_phase(ns, name, &outcome.status.phase.to_string());
    for (replset, rs) in &outcome.status.replica_sets {
        metrics.set_replica_set_members(ns, name, replset, i64::from(rs.size), i64::from(rs.ready));
    }
    if let Some(routers) = &outcome.status.routers {
        metrics.set_replica_set_members(ns, name, ROUTER_SET, i64::from(routers.size), i64::from(routers.ready));
    }
    for replset in &outcome.mutated {
        metrics.record_rollout_mutation(ns, name, replset);
    }
    if let Some(summary) = &outcome.status.backup_summary {
        metrics.set_backups(
            ns,
            name,
            &[
                ("Completed", i64::from(summary.completed)),
                ("Failed", i64::from(summary.failed)),
                ("Running", i64::from(summary.in_progress)),
            ],
        );
    }
}

/// Result of one reconcile pass, before it is published
#[derive(Debug)]
pub struct PassOutcome {
    pub status: MongoClusterStatus,
    /// Requeue interval when the pass did not fail
    pub requeue: Duration,
    /// Most specific failure of the pass
    pub error: Option<Error>,
    /// Sets that issued a mutation this pass
    pub mutated: Vec<String>,
}

/// What every step of a pass acts on
struct PassScope<'a> {
    cluster: &'a MongoCluster,
    key: &'a ClusterKey,
    collaborators: &'a Collaborators,
    config: &'a OperatorConfig,
}

/// Everything a completed pass observed and did
#[derive(Default)]
struct Pass {
    replica_sets: BTreeMap<String, ReplicaSetStatus>,
    routers: Option<RouterStatus>,
    unregistered_shards: Vec<String>,
    backups: BackupOutcome,
    restore: Option<RestoreStatus>,
    credentials: BTreeMap<String, CredentialStatus>,
    backup_errors: Vec<String>,
    errors: Vec<Error>,
    mutated: Vec<String>,
}

/// Run one pass against `cluster` and compute its status. Never publishes anything.
pub async fn run_pass(
    cluster: &MongoCluster,
    collaborators: &Collaborators,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> PassOutcome {
    let previous = cluster.status.as_ref();
    let generation = cluster.metadata.generation;
    let previous_retries = previous.and_then(|p| p.retry_count).unwrap_or(0);

    match drive(cluster, collaborators, config, now).await {
        Ok(mut pass) => {
            let error = (!pass.errors.is_empty())
                .then(|| pass.errors.swap_remove(0))
                .map(|e| within_budget(e, previous_retries, config.retry_budget));
            let status = aggregate(StatusInputs {
                previous,
                generation,
                replica_sets: pass.replica_sets,
                routers: pass.routers,
                unregistered_shards: pass.unregistered_shards,
                backups: pass.backups.records,
                backup_summary: Some(pass.backups.summary),
                pitr: pass.backups.pitr,
                restore: pass.restore,
                restore_requested: cluster.spec.restore.is_some(),
                credentials: pass.credentials,
                backup_errors: pass.backup_errors,
                pass_error: error.as_ref(),
                stopping: false,
                now,
            });
            let requeue = if status.phase == ClusterPhase::Ready && status.backup_summary.as_ref().is_none_or(|s| s.in_progress == 0) {
                config.requeue_idle
            } else {
                config.requeue_active
            };
            PassOutcome {
                status,
                requeue,
                error,
                mutated: pass.mutated,
            }
        }
        Err(e) => {
            let e = within_budget(e, previous_retries, config.retry_budget);
            warn!(error = %e, "Reconcile pass aborted");
            let mut inputs = StatusInputs::carried_over(previous, generation, now);
            inputs.restore_requested = cluster.spec.restore.is_some();
            inputs.pass_error = Some(&e);
            let status = aggregate(inputs);
            PassOutcome {
                status,
                requeue: config.requeue_active,
                error: Some(e),
                mutated: Vec::new(),
            }
        }
    }
}

/// Surface a transient error as terminal once the retry budget is spent
fn within_budget(error: Error, previous_retries: i32, budget: i32) -> Error {
    let attempts = previous_retries + 1;
    if error.is_retryable() && !matches!(error, Error::Cancelled(_)) && attempts >= budget {
        Error::RetryBudgetExhausted {
            attempts,
            last_error: error.to_string(),
        }
    } else {
        error
    }
}

async fn ensure_not_deleted(cluster: &MongoCluster, collaborators: &Collaborators, config: &OperatorConfig) -> Result<()> {
    let deleted = bounded(
        config.call_timeout,
        "deletion check",
        collaborators.platform.deletion_requested(cluster),
    )
    .await?;
    if deleted {
        info!("Deletion observed mid-pass, issuing no further mutations");
        return Err(Error::Cancelled(format!("{} is being deleted", cluster.name_any())));
    }
    Ok(())
}

/// Members able to run the backup agent: healthy secondaries first, then primaries
fn agent_candidates(graph: &TopologyGraph, reports: &BTreeMap<String, HealthReport>) -> Vec<String> {
    let mut secondaries = Vec::new();
    let mut primaries = Vec::new();
    for name in &graph.data_sets {
        let Some(report) = reports.get(name) else {
            continue;
        };
        for (pod, member) in &report.members {
            if member.health != MemberHealth::Healthy {
                continue;
            }
            if report.primary.as_deref() == Some(pod.as_str()) {
                primaries.push(pod.clone());
            } else {
                secondaries.push(pod.clone());
            }
        }
    }
    secondaries.extend(primaries);
    secondaries
}

/// Members users are written through, and the sets that have none right now.
/// A set whose cluster admin does not exist yet has none: the first user created
/// there would close the localhost exception the admin is created through.
fn credential_targets(
    graph: &TopologyGraph,
    reports: &BTreeMap<String, HealthReport>,
    routers: Option<&RouterHealth>,
    admin_ready: &BTreeMap<String, bool>,
) -> (Vec<String>, Vec<String>) {
    let ready = |name: &str| admin_ready.get(name).copied().unwrap_or(false);
    if let Some(config_server) = &graph.config_server {
        if !ready(config_server) {
            return (Vec::new(), vec![config_server.clone()]);
        }
        return match routers.and_then(RouterHealth::any_healthy) {
            Some(router) => (vec![router.to_string()], Vec::new()),
            None => (Vec::new(), vec![ROUTER_SET.to_string()]),
        };
    }
    let mut targets = Vec::new();
    let mut missing = Vec::new();
    for name in &graph.data_sets {
        match reports.get(name).and_then(|r| r.primary.clone()) {
            Some(primary) if ready(name) => targets.push(primary),
            _ => missing.push(name.clone()),
        }
    }
    (targets, missing)
}

fn rollout_busy(state: &RolloutState) -> bool {
    matches!(state.phase, RolloutPhase::Mutating | RolloutPhase::Verifying)
}

async fn drive(
    cluster: &MongoCluster,
    collaborators: &Collaborators,
    config: &OperatorConfig,
    now: DateTime<Utc>,
) -> Result<Pass> {
    let spec = &cluster.spec;
    let key = ClusterKey::from_cluster(cluster);
    let key = &key;
    let scope = PassScope {
        cluster,
        key,
        collaborators,
        config,
    };
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation.unwrap_or(0);
    let admin = collaborators.admin.as_ref();
    let agent = collaborators.agent.as_ref();

    validate_spec(spec)?;

    let members = bounded(config.call_timeout, "member listing", collaborators.platform.list_members(cluster)).await?;
    let observed = ObservedState::from_members(members);
    let graph = desired_topology(spec);
    for set in graph.replica_sets() {
        let current = observed.set(&set.name).iter().filter(|m| !m.terminating).count() as i32;
        check_size_change(&set.name, current, set.size)?;
    }
    let diff = compute_diff(&graph, &observed);

    let observed_ref = &observed;
    let checks = graph.replica_sets().map(|set| async move {
        let report = inspect(admin, key, &set.name, observed_ref.set(&set.name), config.health_timeout).await;
        (set.name.clone(), report)
    });
    let mut reports: BTreeMap<String, HealthReport> = join_all(checks).await.into_iter().collect();
    let router_health = match graph.routers {
        Some(_) => Some(inspect_routers(admin, key, observed.set(ROUTER_SET), config.health_timeout).await),
        None => None,
    };
    if let Some(routers) = &router_health {
        reports.insert(ROUTER_SET.to_string(), routers.to_report(ROUTER_SET));
    }

    ensure_not_deleted(cluster, collaborators, config).await?;

    let mut pass = Pass::default();
    let admin_ready = bootstrap_admins(&scope, &graph, &reports, &previous, &mut pass).await;
    let candidates = agent_candidates(&graph, &reports);

    let quiesced = !backup_active(&previous.backups) && !previous.replica_sets.values().any(|rs| rollout_busy(&rs.rollout));
    let restore = reconcile_restore(
        agent,
        &RestoreInputs {
            key,
            spec: spec.restore.as_ref(),
            backup: spec.backup.as_ref(),
            records: &previous.backups,
            quiesced,
            pitr_stopped: previous.pitr.as_ref().is_none_or(|p| !p.running),
            candidates: &candidates,
            data_sets_ready: graph
                .replica_sets()
                .all(|s| reports.get(&s.name).is_some_and(HealthReport::has_quorum)),
            now,
            timeout: config.call_timeout,
            max_verify_passes: config.max_verify_passes,
        },
        previous.restore.clone(),
    )
    .await;
    let isolated = restore.isolate;
    let restore_active = isolated || restore.status.as_ref().is_some_and(|r| !r.phase.is_terminal());
    pass.backup_errors.extend(restore.agent_error);
    pass.restore = restore.status;

    let disabled = BackupSpec::default();
    pass.backups = reconcile_backups(
        agent,
        &BackupInputs {
            key,
            spec: spec.backup.as_ref().unwrap_or(&disabled),
            candidates: &candidates,
            restore_active,
            now,
            timeout: config.call_timeout,
        },
        previous.backups.clone(),
        previous.pitr.clone(),
    )
    .await;
    pass.backup_errors.extend(pass.backups.agent_errors.drain(..));

    let mut restarts = Vec::new();
    if restore_active {
        // A restore rewrites the user collections; rotation resumes afterwards
        pass.credentials = previous.credentials.clone();
    } else {
        let (targets, missing_targets) = credential_targets(&graph, &reports, router_health.as_ref(), &admin_ready);
        let cache_pods: Vec<String> = observed
            .members
            .iter()
            .filter(|(name, _)| graph.set(name).is_some())
            .flat_map(|(_, members)| members.iter())
            .filter(|m| !m.terminating)
            .map(|m| m.id.pod_name(&key.name))
            .collect();
        let restarts_pending = previous
            .replica_sets
            .values()
            .map(|rs| &rs.rollout)
            .chain(previous.routers.as_ref().map(|r| &r.rollout))
            .any(|r| !r.pending_restarts.is_empty());
        let rotation = rotate_credentials(
            admin,
            collaborators.store.as_ref(),
            &RotationInputs {
                key,
                policy: spec.credentials.as_ref(),
                targets: &targets,
                missing_targets: &missing_targets,
                cache_pods: &cache_pods,
                restarts_pending,
                timeout: config.call_timeout,
            },
            &previous.credentials,
        )
        .await;
        pass.credentials = rotation.statuses;
        pass.errors.extend(rotation.errors);
        restarts = rotation.restarts;
    }

    ensure_not_deleted(cluster, collaborators, config).await?;

    let config_db = graph.config_db(&key.name, |replset, pod| key.member_host(replset, pod));
    let sharding_changes = graph.is_sharded()
        && (graph
            .data_sets
            .iter()
            .any(|s| !previous.replica_sets.get(s).is_some_and(|r| r.registered))
            || diff.sets.keys().any(|name| graph.set(name).is_none()));
    let mut config_server_stable = true;
    let mut config_server_resizing = false;

    for set in graph.replica_sets() {
        let prior = previous.replica_sets.get(&set.name);
        let Some(report) = reports.get(&set.name) else {
            continue;
        };
        let set_diff = diff.set(&set.name).cloned().unwrap_or_default();

        let blocked = (set.role == SetRole::Shard && !config_server_stable && (sharding_changes || config_server_resizing))
            .then(|| "waiting for the config server rollout to reach Stable".to_string());
        let mut state = prior.map(|p| p.rollout.clone()).unwrap_or_default();
        queue_restarts(&mut state, &restarts, observed.set(&set.name), &key.name);

        let input = RolloutInput {
            cluster: &key.name,
            set,
            diff: &set_diff,
            health: report,
            observed: observed.set(&set.name),
            strategy: spec.update_strategy,
            generation,
            paused: isolated,
            blocked,
            max_verify_passes: config.max_verify_passes,
            ever_initialized: prior.is_some_and(|p| p.initialized),
        };
        let next = advance_rollout(&scope, &input, &state, None, &mut pass).await;

        if set.role == SetRole::ConfigServer {
            config_server_stable = next.phase == RolloutPhase::Stable;
            config_server_resizing = set_diff.changes_membership()
                || next
                    .current
                    .iter()
                    .chain(&next.plan)
                    .any(|a| matches!(a, RolloutAction::Create(_) | RolloutAction::Delete(_)));
        }
        pass.replica_sets.insert(
            set.name.clone(),
            ReplicaSetStatus {
                size: set.size,
                ready: report.healthy_count() as i32,
                primary: report.primary.clone(),
                initialized: report.initialized || prior.is_some_and(|p| p.initialized),
                admin_ready: admin_ready.get(&set.name).copied().unwrap_or(false),
                registered: set.role == SetRole::Shard && prior.is_some_and(|p| p.registered),
                paused: isolated,
                rollout: next,
            },
        );
    }

    if let (Some(routers), Some(report)) = (&graph.routers, reports.get(ROUTER_SET)) {
        let unsettled: Vec<&str> = pass
            .replica_sets
            .iter()
            .filter(|(_, rs)| rs.rollout.phase != RolloutPhase::Stable)
            .map(|(name, _)| name.as_str())
            .collect();
        let blocked = (!unsettled.is_empty())
            .then(|| format!("waiting for replica sets to reach Stable: {}", unsettled.join(", ")));
        let mut state = previous.routers.as_ref().map(|r| r.rollout.clone()).unwrap_or_default();
        queue_restarts(&mut state, &restarts, observed.set(ROUTER_SET), &key.name);
        let set_diff = diff.set(ROUTER_SET).cloned().unwrap_or_default();

        let input = RolloutInput {
            cluster: &key.name,
            set: routers,
            diff: &set_diff,
            health: report,
            observed: observed.set(ROUTER_SET),
            strategy: spec.update_strategy,
            generation,
            paused: false,
            blocked,
            max_verify_passes: config.max_verify_passes,
            ever_initialized: false,
        };
        let next = advance_rollout(&scope, &input, &state, config_db.clone(), &mut pass).await;
        pass.routers = Some(RouterStatus {
            size: routers.size,
            ready: report.healthy_count() as i32,
            rollout: next,
        });
    }

    tear_down_orphans(&scope, &graph, &diff, &observed, &mut pass).await;

    if graph.is_sharded() && !restore_active {
        register_shards(&scope, &graph, &reports, router_health.as_ref(), &mut pass).await;
    }
    pass.unregistered_shards = graph
        .data_sets
        .iter()
        .filter(|name| graph.is_sharded() && !pass.replica_sets.get(*name).is_some_and(|rs| rs.registered))
        .cloned()
        .collect();

    Ok(pass)
}

/// Hand restarts requested by credential rotation to the set owning each pod
fn queue_restarts(state: &mut RolloutState, restarts: &[String], members: &[ObservedMember], cluster: &str) {
    for member in members {
        let pod = member.id.pod_name(cluster);
        if restarts.contains(&pod) && !state.pending_restarts.contains(&pod) {
            state.pending_restarts.push(pod);
        }
    }
}

/// Create the cluster admin on every replica set that has a primary and no admin
/// yet. Returns which sets have their admin.
async fn bootstrap_admins(
    scope: &PassScope<'_>,
    graph: &TopologyGraph,
    reports: &BTreeMap<String, HealthReport>,
    previous: &MongoClusterStatus,
    pass: &mut Pass,
) -> BTreeMap<String, bool> {
    let mut ready = BTreeMap::new();
    for set in graph.replica_sets() {
        let done = previous.replica_sets.get(&set.name).is_some_and(|rs| rs.admin_ready);
        let primary = reports.get(&set.name).and_then(|r| r.primary.as_deref());
        let created = match (done, primary) {
            (true, _) => true,
            (false, None) => false,
            (false, Some(primary)) => match bounded(
                scope.config.call_timeout,
                "admin bootstrap",
                scope.collaborators.admin.bootstrap_admin(scope.key, &set.name, primary),
            )
            .await
            {
                Ok(()) => {
                    info!(cluster = %scope.key, replset = %set.name, primary, "Cluster admin user in place");
                    true
                }
                Err(e) => {
                    pass.errors.push(e);
                    false
                }
            },
        };
        ready.insert(set.name.clone(), created);
    }
    ready
}

async fn advance_rollout(
    scope: &PassScope<'_>,
    input: &RolloutInput<'_>,
    state: &RolloutState,
    config_db: Option<String>,
    pass: &mut Pass,
) -> RolloutState {
    let (mut next, decision) = rollout::step(state, input);
    match &decision {
        RolloutDecision::Fail(failure) => {
            warn!(replset = %input.set.name, %failure, "Rollout entered Error");
        }
        RolloutDecision::Wait(reason) => {
            debug!(replset = %input.set.name, reason = %reason, "Rollout waiting");
        }
        d if d.is_mutation() => {
            let target = RolloutTarget {
                cluster: scope.cluster,
                key: scope.key,
                set: input.set,
                health: input.health,
                config_db,
            };
            let result = rollout::execute(scope.collaborators, scope.config.call_timeout, &target, d).await;
            rollout::record_execution(&mut next, d, &result);
            pass.mutated.push(input.set.name.clone());
            if let Err(e) = result {
                pass.errors.push(e);
            }
        }
        _ => {}
    }
    next
}

/// Delete the workloads of sets no longer in the cluster spec, one member per pass
async fn tear_down_orphans(
    scope: &PassScope<'_>,
    graph: &TopologyGraph,
    diff: &TopologyDiff,
    observed: &ObservedState,
    pass: &mut Pass,
) {
    for (name, set_diff) in &diff.sets {
        if graph.set(name).is_some() {
            continue;
        }
        let Some(member) = set_diff
            .remove
            .iter()
            .find(|id| observed.member(id).is_some_and(|m| !m.terminating))
        else {
            continue;
        };
        info!(cluster = %scope.key, replset = %name, member = %member, "Deleting member of a set removed from the cluster spec");
        match bounded(
            scope.config.call_timeout,
            "member delete",
            scope.collaborators.platform.delete_member(scope.cluster, member),
        )
        .await
        {
            Ok(()) => pass.mutated.push(name.clone()),
            Err(e) => pass.errors.push(e),
        }
    }
}

async fn register_shards(
    scope: &PassScope<'_>,
    graph: &TopologyGraph,
    reports: &BTreeMap<String, HealthReport>,
    routers: Option<&RouterHealth>,
    pass: &mut Pass,
) {
    let Some(router) = routers.and_then(RouterHealth::any_healthy) else {
        return;
    };
    for name in &graph.data_sets {
        let (Some(status), Some(report)) = (pass.replica_sets.get_mut(name), reports.get(name)) else {
            continue;
        };
        if status.registered || !report.has_quorum() {
            continue;
        }
        let hosts: Vec<String> = report
            .config_members
            .iter()
            .map(|pod| scope.key.member_host(name, pod))
            .collect();
        match bounded(
            scope.config.call_timeout,
            "shard registration",
            scope.collaborators.admin.add_shard(scope.key, router, name, &hosts),
        )
        .await
        {
            Ok(()) => {
                info!(cluster = %scope.key, shard = %name, router, "Shard registered");
                status.registered = true;
            }
            Err(e) => pass.errors.push(e),
        }
    }
}

/// Check if the finalizer is present
fn has_finalizer(cluster: &MongoCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

async fn add_finalizer(cluster: &MongoCluster, ctx: &Context, key: &ClusterKey) -> Result<()> {
    let api: Api<MongoCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let mut finalizers = cluster.metadata.finalizers.clone().unwrap_or_default();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": cluster.resource_version(),
        }
    });

    api.patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(cluster = %key, "Added finalizer");
    Ok(())
}

/// Terminal state of a deleted cluster: stop agents, then let the resource go
async fn handle_deletion(cluster: &MongoCluster, ctx: &Context, key: &ClusterKey) -> Result<Action> {
    info!(cluster = %key, "Finalizing MongoCluster");

    if cluster.status.as_ref().is_none_or(|s| s.phase != ClusterPhase::Stopping) {
        let mut inputs = StatusInputs::carried_over(cluster.status.as_ref(), cluster.metadata.generation, Utc::now());
        inputs.stopping = true;
        let status = aggregate(inputs);
        if let Err(e) = StatusManager::new(cluster, ctx.client.clone()).write(&status).await {
            debug!(error = %e, "Could not publish Stopping status");
        }
    }

    finalize(&ctx.collaborators, cluster, ctx.config.call_timeout).await?;

    if has_finalizer(cluster) {
        let api: Api<MongoCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
        let remaining: Vec<String> = cluster
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({ "metadata": { "finalizers": remaining } });
        match api
            .patch(&key.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!(cluster = %key, "Removed finalizer"),
            Err(e) if is_namespace_not_found_error(&e) => {
                warn!(cluster = %key, "Namespace already gone, finalizer goes with it");
            }
            Err(e) => return Err(e.into()),
        }
    }

    ctx.forget(key);
    if let Some(health) = &ctx.health_state {
        health.metrics.forget_cluster(&key.namespace, &key.name);
    }
    Ok(Action::await_change())
}
