//! Rollout ordering and gating across reconcile passes

use std::collections::BTreeMap;

use chrono::Utc;
use mongodb_operator::controller::topology::{MemberId, SetRole, config_hash};
use mongodb_operator::crd::{ClusterPhase, MongoCluster, RolloutPhase, UpdateStrategy};

use crate::common::*;

const NEW_IMAGE: &str = "percona/percona-server-mongodb:7.0.14";

fn pod(replset: &str, ordinal: i32) -> String {
    MemberId::new(replset, ordinal).pod_name("demo")
}

fn running(size: i32) -> FakeCluster {
    let hash = config_hash(&BTreeMap::new(), SetRole::ReplicaSet);
    FakeCluster::new("demo").with_replica_set("rs0", size, TEST_IMAGE, &hash)
}

fn phase(cluster: &MongoCluster) -> ClusterPhase {
    cluster.status.as_ref().map(|s| s.phase).unwrap_or_default()
}

fn rollout_phase(cluster: &MongoCluster, replset: &str) -> RolloutPhase {
    cluster.status.as_ref().unwrap().replica_sets[replset].rollout.phase
}

mod strategy_tests {
    use super::*;

    #[tokio::test]
    async fn test_rolling_update_goes_by_descending_ordinal() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image(NEW_IMAGE)
            .with_replica_set("rs0", 3)
            .with_strategy(UpdateStrategy::RollingUpdate)
            .build();

        let passes = converge(&mut cluster, &fake, 15, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 15);
        assert_eq!(
            fake.calls("update"),
            vec![
                format!("update {}", pod("rs0", 2)),
                format!("update {}", pod("rs0", 1)),
                format!("update {}", pod("rs0", 0)),
            ]
        );
        assert!(fake.world().members.values().all(|m| m.image == NEW_IMAGE));
    }

    #[tokio::test]
    async fn test_configuration_change_updates_every_member_once() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("rs0", 3)
            .with_parameter("wiredTigerCacheSizeGB", "2")
            .build();

        let passes = converge(&mut cluster, &fake, 15, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 15);
        assert_eq!(fake.calls("update").len(), 3);

        let hashes: Vec<String> = fake.world().members.values().map(|m| m.config_hash.clone()).collect();
        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
        assert_ne!(hashes[0], config_hash(&BTreeMap::new(), SetRole::ReplicaSet));
    }

    #[tokio::test]
    async fn test_single_member_set_updates_without_step_down() {
        let fake = running(1);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image(NEW_IMAGE)
            .with_replica_set("rs0", 1)
            .build();

        let passes = converge(&mut cluster, &fake, 10, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 10);
        assert_eq!(fake.calls("update"), vec![format!("update {}", pod("rs0", 0))]);
        assert!(fake.calls("step_down").is_empty());
    }

    #[tokio::test]
    async fn test_one_mutation_per_pass() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_image(NEW_IMAGE)
            .with_replica_set("rs0", 3)
            .build();

        for _ in 0..6 {
            let before = fake.world().calls.len();
            let outcome = pass(&mut cluster, &fake, Utc::now()).await;
            let issued = fake.world().calls.len() - before;
            assert!(issued <= 1, "a pass issued {} calls", issued);
            assert!(outcome.mutated.len() <= 1);
        }
    }
}

mod sharded_rollout_tests {
    use super::*;

    #[tokio::test]
    async fn test_routers_update_after_replica_sets_settle() {
        let fake = FakeCluster::new("demo");
        let mut cluster = MongoClusterBuilder::new("demo", "db")
            .with_replica_set("shard0", 3)
            .with_sharding(3, 2)
            .build();
        let passes = converge(&mut cluster, &fake, 40, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 40);

        cluster.spec.image = NEW_IMAGE.to_string();
        cluster.metadata.generation = Some(2);
        let passes = converge(&mut cluster, &fake, 40, |c| {
            phase(c) == ClusterPhase::Ready
                && c.status.as_ref().is_some_and(|s| s.observed_generation == Some(2))
        })
        .await;
        assert!(passes < 40);

        let updates = fake.calls("update");
        assert_eq!(updates.len(), 8);
        let first_router = updates.iter().position(|c| c.contains("-mongos-")).unwrap();
        assert!(
            updates[..first_router]
                .iter()
                .all(|c| c.contains("-cfg-") || c.contains("-shard0-"))
        );
        assert!(updates[first_router..].iter().all(|c| c.contains("-mongos-")));
        assert!(fake.world().members.values().all(|m| m.image == NEW_IMAGE));
    }
}

mod stall_tests {
    use super::*;

    /// A member that never starts stalls verification into Error; a new spec
    /// generation lifts the halt and the member is admitted once it runs
    #[tokio::test]
    async fn test_stalled_create_errors_until_new_generation() {
        let fake = running(3);
        let mut cluster = MongoClusterBuilder::new("demo", "db").with_replica_set("rs0", 4).build();

        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(fake.calls("create"), vec![format!("create {}", pod("rs0", 3))]);
        fake.world()
            .members
            .get_mut(&MemberId::new("rs0", 3))
            .unwrap()
            .ready = false;

        let passes = converge(&mut cluster, &fake, 15, |c| {
            rollout_phase(c, "rs0") == RolloutPhase::Error
        })
        .await;
        assert!(passes < 15);
        let status = cluster.status.as_ref().unwrap();
        assert_eq!(status.phase, ClusterPhase::Error);
        assert!(
            status.replica_sets["rs0"]
                .rollout
                .message
                .as_deref()
                .unwrap()
                .contains("rollout stalled")
        );

        // Same generation: stays halted
        pass(&mut cluster, &fake, Utc::now()).await;
        assert_eq!(rollout_phase(&cluster, "rs0"), RolloutPhase::Error);

        cluster.metadata.generation = Some(2);
        pass(&mut cluster, &fake, Utc::now()).await;
        assert_ne!(rollout_phase(&cluster, "rs0"), RolloutPhase::Error);
        assert_ne!(phase(&cluster), ClusterPhase::Error);

        fake.world()
            .members
            .get_mut(&MemberId::new("rs0", 3))
            .unwrap()
            .ready = true;
        let passes = converge(&mut cluster, &fake, 5, |c| phase(c) == ClusterPhase::Ready).await;
        assert!(passes < 5);
        assert_eq!(
            fake.calls("add_member"),
            vec![format!("add_member rs0 {}", pod("rs0", 3))]
        );
        assert_eq!(fake.calls("create").len(), 1);
    }
}
