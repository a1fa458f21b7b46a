//! Finalization of deleted MongoCluster resources
//!
//! Member workloads and services carry owner references and are garbage collected
//! by Kubernetes. What the garbage collector cannot see is the backup agent state:
//! running backups and the continuous capture are stopped here, and with
//! `deleteOnFinalize` the catalogued backups are removed from their storage.

use std::time::Duration;

use tracing::{info, warn};

use crate::controller::backup::destination;
use crate::controller::context::Collaborators;
use crate::controller::error::{Result, bounded};
use crate::crd::{BackupState, BackupType, MongoCluster};
use crate::resources::common::ClusterKey;

/// Check if a kube error indicates the namespace was not found.
///
/// A resource whose namespace is already gone can be read but not patched; its
/// finalizer is dropped with the namespace.
pub fn is_namespace_not_found_error(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404 && resp.message.contains("namespace"))
}

/// Stop agent work and, when requested, delete backups from storage.
///
/// Stopping is best effort: an agent that cannot be reached is gone with its pod.
/// Deleting backups is not: a failure keeps the finalizer so the pass is retried.
pub async fn finalize(collaborators: &Collaborators, cluster: &MongoCluster, timeout: Duration) -> Result<()> {
    let key = ClusterKey::from_cluster(cluster);
    let agent = collaborators.agent.as_ref();
    let Some(status) = &cluster.status else {
        return Ok(());
    };

    let running = status
        .backups
        .iter()
        .filter(|r| matches!(r.state, BackupState::Starting | BackupState::Running))
        .filter_map(|r| Some((r.name.as_str(), r.member.as_deref()?, r.operation.as_deref()?)));
    let pitr = status
        .pitr
        .as_ref()
        .filter(|p| p.running)
        .and_then(|p| Some(("pitr", p.member.as_deref()?, p.operation.as_deref()?)));
    for (name, member, operation) in running.chain(pitr) {
        match bounded(timeout, "agent stop", agent.stop(&key, member, operation)).await {
            Ok(()) => info!(cluster = %key, operation = name, "Stopped backup agent"),
            Err(e) => warn!(cluster = %key, operation = name, error = %e, "Could not stop backup agent"),
        }
    }

    let Some(spec) = cluster.spec.backup.as_ref().filter(|b| b.delete_on_finalize) else {
        return Ok(());
    };
    let Some(member) = status
        .backups
        .iter()
        .find_map(|r| r.member.as_deref())
        .or_else(|| status.pitr.as_ref().and_then(|p| p.member.as_deref()))
    else {
        return Ok(());
    };
    for record in status
        .backups
        .iter()
        .filter(|r| r.state == BackupState::Completed && r.backup_type != BackupType::PitrChunk)
    {
        let Some(destination) = destination(spec, &record.storage_name) else {
            continue;
        };
        bounded(
            timeout,
            "backup deletion",
            agent.delete_backup(&key, member, &destination, &record.name),
        )
        .await?;
        info!(cluster = %key, backup = %record.name, "Deleted backup from storage");
    }
    Ok(())
}
