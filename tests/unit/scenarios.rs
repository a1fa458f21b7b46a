//! Whole reconcile passes against the in-memory collaborators

use std::collections::BTreeMap;

use chrono::Utc;
use mongodb_operator::controller::Error;
use mongodb_operator::controller::status::{condition_status, condition_types};
use mongodb_operator::controller::topology::{MemberId, SetRole, config_hash, quorum};
use mongodb_operator::crd::{
    BackupRecord, BackupState, BackupType, ClusterPhase, MongoCluster, RestorePhase, RolloutAction,
    RolloutPhase,
};

use crate::common::*;

fn pod(replset: &str, ordinal: i32) -> String {
    format!("demo-{}-{}-0", replset, ordinal)
}

fn data_hash() -> String {
    config_hash(&BTreeMap::new(), SetRole::ReplicaSet)
}

/// A healthy, initialized `rs0` of `size` members running the desired image
fn running(size: i32) -> FakeCluster {
    FakeCluster::new("demo").with_replica_set("rs0", size, TEST_IMAGE, &data_hash())
}

fn rs0(cluster: &MongoCluster) -> &mongodb_operator::crd::ReplicaSetStatus {
    &cluster.status.as_ref().unwrap().replica_sets["rs0"]
}

fn phase(cluster: &MongoCluster) -> ClusterPhase {
    cluster.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

/// Healthy members of the replica set configuration form a majority of it
fn majority_healthy(fake: &FakeCluster, replset: &str) -> bool {
    let world = fake.world();
    let Some(rs) = world.replsets.get(replset) else {
        return true;
    };
    let healthy = rs.config.iter().filter(|p| !world.down.contains(*p)).count();
    healthy >= quorum(rs.config.len())
}

mod replica_set_tests {
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_from_nothing_to_ready() {
        let fake = FakeCluster::new("demo");
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();

        let passes = converge(&mut cluster, &fake, 20, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 20, "cluster never became Ready");

        assert_eq!(fake.calls("initiate"), vec![format!("initiate rs0 {}", pod("rs0", 0))]);
        assert_eq!(fake.calls("add_member").len(), 2);
        assert_eq!(fake.calls("bootstrap_admin"), vec![format!("bootstrap_admin rs0 on {}", pod("rs0", 0))]);
        let status = rs0(&cluster);
        assert!(status.admin_ready);
        assert_eq!(status.ready, 3);
        assert_eq!(status.primary.as_deref(), Some(pod("rs0", 0).as_str()));
        assert_eq!(status.rollout.phase, RolloutPhase::Stable);
    }

    /// Growing a healthy set by two members plans exactly two additions, and the
    /// second is only created once the first has been verified
    #[tokio::test]
    async fn test_scale_up_adds_one_member_at_a_time() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 5).build();
        let now = Utc::now();

        pass(&mut cluster, &fake, now).await;
        let rollout = &rs0(&cluster).rollout;
        assert_eq!(rollout.phase, RolloutPhase::Verifying);
        assert_eq!(rollout.current, Some(RolloutAction::Create(pod("rs0", 3))));
        assert_eq!(rollout.plan, vec![RolloutAction::Create(pod("rs0", 4))]);
        assert_eq!(fake.calls("create"), vec![format!("create {}", pod("rs0", 3))]);

        // Admission of member 3 happens before member 4 exists
        pass(&mut cluster, &fake, now).await;
        assert_eq!(fake.calls("add_member"), vec![format!("add_member rs0 {}", pod("rs0", 3))]);
        assert_eq!(fake.calls("create").len(), 1);
        assert_eq!(rs0(&cluster).rollout.phase, RolloutPhase::Verifying);

        pass(&mut cluster, &fake, now).await;
        assert_eq!(
            fake.calls("create"),
            vec![format!("create {}", pod("rs0", 3)), format!("create {}", pod("rs0", 4))]
        );
        assert_eq!(rs0(&cluster).rollout.current, Some(RolloutAction::Create(pod("rs0", 4))));

        let passes = converge(&mut cluster, &fake, 10, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 10);
        assert_eq!(fake.calls("create").len(), 2);
        assert_eq!(rs0(&cluster).ready, 5);
    }

    /// Shrinking 5 to 3 with member 4 unreachable removes the healthy member 3
    /// and leaves member 4 alone until its state is known again
    #[tokio::test]
    async fn test_scale_down_defers_unreachable_member() {
        let fake = running(5);
        fake.take_down(&pod("rs0", 4));
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();
        let now = Utc::now();

        for _ in 0..5 {
            pass(&mut cluster, &fake, now).await;
            assert!(majority_healthy(&fake, "rs0"));
        }

        assert_eq!(fake.calls("remove_member"), vec![format!("remove_member rs0 {}", pod("rs0", 3))]);
        assert_eq!(fake.calls("delete"), vec![format!("delete {}", pod("rs0", 3))]);
        let rollout = &rs0(&cluster).rollout;
        assert_eq!(rollout.plan, vec![RolloutAction::Delete(pod("rs0", 4))]);
        assert!(rollout.message.as_deref().unwrap().contains("member state unknown"));
        assert_eq!(phase(&cluster), ClusterPhase::Initializing);

        fake.bring_up(&pod("rs0", 4));
        let passes = converge(&mut cluster, &fake, 10, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 10);
        assert!(majority_healthy(&fake, "rs0"));
        assert_eq!(
            fake.calls("remove_member"),
            vec![
                format!("remove_member rs0 {}", pod("rs0", 3)),
                format!("remove_member rs0 {}", pod("rs0", 4)),
            ]
        );
        assert_eq!(rs0(&cluster).size, 3);
    }

    /// While the configured members answer nothing, the member being added is the
    /// only one that answers, and it knows of no replica set yet
    #[tokio::test]
    async fn test_unreachable_set_while_scaling_up_is_never_initiated_again() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 4).build();
        let now = Utc::now();

        pass(&mut cluster, &fake, now).await;
        assert_eq!(fake.calls("create"), vec![format!("create {}", pod("rs0", 3))]);

        for ordinal in 0..3 {
            fake.take_down(&pod("rs0", ordinal));
        }
        for _ in 0..3 {
            pass(&mut cluster, &fake, now).await;
            assert!(fake.calls("initiate").is_empty());
            assert!(fake.calls("add_member").is_empty());
        }
        assert_eq!(fake.world().replsets["rs0"].config.len(), 3);
        assert!(rs0(&cluster).initialized);
        assert!(
            rs0(&cluster)
                .rollout
                .message
                .as_deref()
                .unwrap()
                .contains("report its configuration")
        );

        for ordinal in 0..3 {
            fake.bring_up(&pod("rs0", ordinal));
        }
        let passes = converge(&mut cluster, &fake, 10, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 10);
        assert!(fake.calls("initiate").is_empty());
        assert_eq!(fake.calls("add_member"), vec![format!("add_member rs0 {}", pod("rs0", 3))]);
        assert_eq!(fake.world().replsets["rs0"].config.len(), 4);
    }

    /// Surplus members whose workloads are down are not deleted while the replica
    /// set configuration cannot be read, since it may still list them
    #[tokio::test]
    async fn test_scale_down_waits_for_configuration_before_deleting() {
        let fake = running(5);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();
        let now = Utc::now();

        for ordinal in 0..5 {
            fake.take_down(&pod("rs0", ordinal));
        }
        for ordinal in 3..5 {
            fake.world().members.get_mut(&MemberId::new("rs0", ordinal)).unwrap().ready = false;
        }
        for _ in 0..3 {
            pass(&mut cluster, &fake, now).await;
        }
        assert!(fake.calls("delete").is_empty());
        assert!(fake.calls("remove_member").is_empty());
        assert!(
            rs0(&cluster)
                .rollout
                .message
                .as_deref()
                .unwrap()
                .contains("could not be read")
        );

        for ordinal in 0..5 {
            fake.world().members.get_mut(&MemberId::new("rs0", ordinal)).unwrap().ready = true;
            fake.bring_up(&pod("rs0", ordinal));
        }
        let passes = converge(&mut cluster, &fake, 15, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 15);
        assert_eq!(fake.world().replsets["rs0"].config.len(), 3);

        let calls = fake.world().calls.clone();
        for ordinal in 3..5 {
            let removed = calls
                .iter()
                .position(|c| *c == format!("remove_member rs0 {}", pod("rs0", ordinal)))
                .unwrap();
            let deleted = calls
                .iter()
                .position(|c| *c == format!("delete {}", pod("rs0", ordinal)))
                .unwrap();
            assert!(removed < deleted);
        }
    }

    #[tokio::test]
    async fn test_image_change_updates_secondaries_before_primary() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image("percona/percona-server-mongodb:7.0.14")
            .with_replica_set("rs0", 3)
            .build();

        let passes = converge(&mut cluster, &fake, 15, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 15);

        assert_eq!(
            fake.calls("update"),
            vec![
                format!("update {}", pod("rs0", 1)),
                format!("update {}", pod("rs0", 2)),
                format!("update {}", pod("rs0", 0)),
            ]
        );
        let world = fake.world();
        let step_down = world.calls.iter().position(|c| c.starts_with("step_down")).unwrap();
        let primary_update = world
            .calls
            .iter()
            .position(|c| *c == format!("update {}", pod("rs0", 0)))
            .unwrap();
        assert!(step_down < primary_update);
    }

    #[tokio::test]
    async fn test_update_that_would_break_quorum_enters_error() {
        let fake = running(3);
        fake.take_down(&pod("rs0", 2));
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image("percona/percona-server-mongodb:7.0.14")
            .with_replica_set("rs0", 3)
            .build();

        let outcome = pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(outcome.status.phase, ClusterPhase::Error);
        assert!(outcome.status.last_error.as_deref().unwrap().contains("without a healthy majority"));
        assert_eq!(rs0(&cluster).rollout.phase, RolloutPhase::Error);
        assert!(fake.calls("update").is_empty());

        // Stays halted for the same generation
        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(phase(&cluster), ClusterPhase::Error);
        assert!(fake.calls("update").is_empty());
    }

    #[tokio::test]
    async fn test_manual_strategy_reports_without_updating() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image("percona/percona-server-mongodb:7.0.14")
            .with_replica_set("rs0", 3)
            .with_strategy(mongodb_operator::crd::UpdateStrategy::Manual)
            .build();

        pass(&mut cluster, &fake, Utc::now()).await;
        assert!(fake.calls("update").is_empty());
        assert_eq!(
            rs0(&cluster).rollout.message.as_deref(),
            Some("3 members pending manual update")
        );
    }

    #[tokio::test]
    async fn test_removed_replica_set_is_torn_down() {
        let fake = running(3).with_replica_set("old", 2, TEST_IMAGE, &data_hash());
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();

        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(fake.calls("delete"), vec![format!("delete {}", pod("old", 1))]);
        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(fake.calls("delete").len(), 2);
        assert!(!cluster.status.as_ref().unwrap().replica_sets.contains_key("old"));
    }
}

mod sharded_tests {
    use super::*;

    #[tokio::test]
    async fn test_sharded_cluster_converges_and_registers_shards() {
        let fake = FakeCluster::new("demo");
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("shard0", 3)
            .with_sharding(3, 2)
            .build();

        pass(&mut cluster, &fake, Utc::now()).await;
        // Shards wait for the config server
        assert_eq!(fake.calls("create"), vec![format!("create {}", pod("cfg", 0))]);
        let status = cluster.status.as_ref().unwrap();
        assert!(
            status.replica_sets["shard0"]
                .rollout
                .message
                .as_deref()
                .unwrap()
                .contains("config server")
        );

        let passes = converge(&mut cluster, &fake, 40, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 40, "sharded cluster never became Ready");

        let world = fake.world();
        assert_eq!(world.shards, vec!["shard0".to_string()]);
        let first_router = world.calls.iter().position(|c| c.starts_with("create demo-mongos")).unwrap();
        let last_shard = world
            .calls
            .iter()
            .rposition(|c| c.starts_with("add_member shard0"))
            .unwrap();
        assert!(last_shard < first_router, "routers are rolled last");
        let status = cluster.status.as_ref().unwrap();
        assert!(status.replica_sets["shard0"].registered);
        assert_eq!(status.routers.as_ref().unwrap().ready, 2);
    }

    /// Growing the config server holds back a shard rollout requested at the same time
    #[tokio::test]
    async fn test_config_server_resize_blocks_shard_rollout() {
        let fake = FakeCluster::new("demo");
        let mut initial = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("shard0", 3)
            .with_sharding(3, 2)
            .build();
        let passes = converge(&mut initial, &fake, 40, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 40);

        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_generation(2)
            .with_replica_set("shard0", 3)
            .with_parameter("operationProfiling.mode", "slowOp")
            .with_sharding(5, 2)
            .with_status(initial.status.clone().unwrap())
            .build();
        let before = fake.world().calls.len();

        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(fake.calls("create").last(), Some(&format!("create {}", pod("cfg", 3))));
        let message = cluster.status.as_ref().unwrap().replica_sets["shard0"].rollout.message.clone();
        assert!(message.unwrap().contains("config server"));

        let passes = converge(&mut cluster, &fake, 40, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 40, "cluster never settled after the resize");

        let world = fake.world();
        let calls = &world.calls[before..];
        let last_cfg_admit = calls.iter().rposition(|c| c.starts_with("add_member cfg")).unwrap();
        let first_shard_update = calls.iter().position(|c| c.starts_with("update demo-shard0")).unwrap();
        assert!(last_cfg_admit < first_shard_update, "shard0 rolled during the config server resize");
        assert_eq!(world.replsets["cfg"].config.len(), 5);
    }
}

mod backup_restore_tests {
    use super::*;

    fn completed(name: &str, storage: &str) -> BackupRecord {
        let at = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        BackupRecord {
            name: name.to_string(),
            storage_name: storage.to_string(),
            backup_type: BackupType::Full,
            state: BackupState::Completed,
            task: None,
            member: Some(pod("rs0", 1)),
            operation: Some("op-0".to_string()),
            requested_at: Some(at.clone()),
            started_at: Some(at.clone()),
            completed_at: Some(at.clone()),
            last_write_at: Some(at),
            chunk_start: None,
            error: None,
        }
    }

    /// A point-in-time restore before any backup exists fails before the agent is asked
    #[tokio::test]
    async fn test_pitr_restore_without_base_backup_fails_fast() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_s3_storage("main")
            .with_backup_request("first", "main")
            .with_pitr_restore("r1", "main", "2026-01-01T00:00:00Z")
            .build();

        let outcome = pass(&mut cluster, &fake, Utc::now()).await;

        let restore = outcome.status.restore.as_ref().unwrap();
        assert_eq!(restore.phase, RestorePhase::Failed);
        assert!(restore.error.as_deref().unwrap().contains("no base backup available"));
        assert!(!restore.data_touched);
        assert!(fake.calls("restore").is_empty());
        assert_eq!(outcome.status.phase, ClusterPhase::Error);
        assert!(outcome.status.last_error.as_deref().unwrap().contains("no base backup available"));
    }

    #[tokio::test]
    async fn test_on_demand_backup_completes() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_s3_storage("main")
            .with_backup_request("nightly", "main")
            .build();

        pass(&mut cluster, &fake, Utc::now()).await;
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.backups[0].state, BackupState::Starting);
        // Secondaries run the agent
        assert_ne!(status.backups[0].member.as_deref(), Some(pod("rs0", 0).as_str()));

        pass(&mut cluster, &fake, Utc::now()).await;
        pass(&mut cluster, &fake, Utc::now()).await;
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.backups.len(), 1);
        assert_eq!(status.backups[0].state, BackupState::Completed);
        assert_eq!(status.backup_summary.as_ref().unwrap().completed, 1);
        assert_eq!(fake.calls("start").len(), 1);
    }

    #[tokio::test]
    async fn test_restore_of_named_backup_pauses_rollouts_until_verified() {
        let fake = running(3);
        let mut previous = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();
        converge(&mut previous, &fake, 5, |c| phase(c) == ClusterPhase::Ready).await;
        let mut status = previous.status.clone().unwrap();
        status.backups.push(completed("b1", "main"));

        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_s3_storage("main")
            .with_backup_restore("r1", "main", "b1")
            .with_status(status)
            .build();
        let now = Utc::now();

        pass(&mut cluster, &fake, now).await;
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.restore.as_ref().unwrap().phase, RestorePhase::Preparing);
        assert!(status.replica_sets["rs0"].paused);
        assert_eq!(status.phase, ClusterPhase::Initializing);

        pass(&mut cluster, &fake, now).await;
        assert_eq!(fake.calls("restore").len(), 1);
        assert!(fake.calls("restore")[0].starts_with("restore b1"));
        let restore = cluster.status.as_ref().unwrap().restore.clone().unwrap();
        assert_eq!(restore.phase, RestorePhase::Restoring);
        assert!(restore.data_touched);

        let passes = converge(&mut cluster, &fake, 5, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 5);
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.restore.as_ref().unwrap().phase, RestorePhase::Ready);
        assert!(!status.replica_sets["rs0"].paused);
        assert_eq!(fake.calls("restore").len(), 1);
    }
}

mod credential_tests {
    use super::*;

    #[tokio::test]
    async fn test_rotation_applies_stores_and_restarts_cached_members() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_user("app", 1, true)
            .build();

        let passes = converge(&mut cluster, &fake, 30, |c| {
            phase(c) == ClusterPhase::Ready
                && c.status
                    .as_ref()
                    .is_some_and(|s| s.credentials.get("app").is_some_and(|u| u.generation == 1))
        })
        .await;
        assert!(passes < 30, "rotation never completed");

        let world = fake.world();
        let stored = &world.credentials["app"];
        assert_eq!(stored.generation, Some(1));
        assert!(stored.pending.is_none());
        assert_eq!(world.db_passwords.get("app"), stored.password.as_ref());
        assert_eq!(world.calls_matching("upsert_user").len(), 1);
        assert_eq!(world.calls_matching("revoke").len(), 1);
        assert_eq!(world.calls_matching("restart").len(), 3);
        // The primary hands over before its restart
        assert_eq!(world.calls_matching("step_down").len(), 1);
    }

    /// Application users are only written once the cluster admin exists, even when
    /// creating the admin fails a few times
    #[tokio::test]
    async fn test_fresh_cluster_creates_admin_before_application_users() {
        let fake = FakeCluster::new("demo");
        fake.fail_next("bootstrap_admin", 2);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_user("app", 0, false)
            .build();

        let passes = converge(&mut cluster, &fake, 40, |c| {
            phase(c) == ClusterPhase::Ready
                && c.status
                    .as_ref()
                    .is_some_and(|s| s.credentials.get("app").is_some_and(|u| u.generation == 0))
        })
        .await;
        assert!(passes < 40, "cluster never settled");

        let calls = fake.world().calls.clone();
        let bootstrap = calls.iter().position(|c| c.starts_with("bootstrap_admin")).unwrap();
        let first_user = calls.iter().position(|c| c.starts_with("upsert_user")).unwrap();
        assert!(bootstrap < first_user);
        assert_eq!(fake.calls("bootstrap_admin").len(), 1);
        assert!(rs0(&cluster).admin_ready);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_step_and_reports_error() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_user("app", 1, false)
            .build();
        let now = Utc::now();

        pass(&mut cluster, &fake, now).await;
        fake.fail_next("write_pending", 1);
        let outcome = pass(&mut cluster, &fake, now).await;

        assert!(outcome.error.as_ref().is_some_and(Error::is_retryable));
        let user = &outcome.status.credentials["app"];
        assert_eq!(user.step, mongodb_operator::crd::RotationStep::Idle);
        assert!(user.message.as_deref().unwrap().contains("failed"));
        assert_eq!(outcome.status.retry_count, Some(1));
        assert!(fake.world().db_passwords.is_empty());

        let outcome = pass(&mut cluster, &fake, now).await;
        assert!(outcome.error.is_none());
        assert_eq!(
            outcome.status.credentials["app"].step,
            mongodb_operator::crd::RotationStep::PendingStored
        );
        assert_eq!(outcome.status.retry_count, Some(0));
    }
}

mod pass_control_tests {
    use super::*;

    #[tokio::test]
    async fn test_deletion_mid_pass_issues_nothing() {
        let fake = FakeCluster::new("demo");
        fake.world().deleting = true;
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();

        let outcome = pass(&mut cluster, &fake, Utc::now()).await;
        assert!(matches!(outcome.error, Some(Error::Cancelled(_))));
        assert!(fake.world().calls.is_empty());
        assert!(outcome.mutated.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_error_without_platform_calls() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_replica_set("rs0", 3)
            .build();

        let outcome = pass(&mut cluster, &fake, Utc::now()).await;
        assert!(matches!(outcome.error, Some(Error::ValidationError(_))));
        assert_eq!(outcome.status.phase, ClusterPhase::Error);
        let valid = outcome
            .status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::CONFIG_VALID)
            .unwrap();
        assert_eq!(valid.status, condition_status::FALSE);
        assert!(fake.world().calls.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retry_budget() {
        let fake = running(3);
        fake.fail_next("list_members", 10);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();

        let mut last = None;
        for _ in 0..test_config().retry_budget {
            last = Some(pass(&mut cluster, &fake, Utc::now()).await);
        }
        let outcome = last.unwrap();
        assert!(matches!(outcome.error, Some(Error::RetryBudgetExhausted { attempts: 5, .. })));
        assert_eq!(outcome.status.phase, ClusterPhase::Error);
    }

    #[tokio::test]
    async fn test_idle_cluster_requeues_slowly() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 3).build();

        let outcome = pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(outcome.status.phase, ClusterPhase::Ready);
        assert_eq!(outcome.requeue, test_config().requeue_idle);
        assert!(fake.world().calls.is_empty());
    }
}
