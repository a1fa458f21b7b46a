//! Unit tests for credential rotation

use std::collections::BTreeMap;
use std::time::Duration;

use mongodb_operator::controller::credentials::{RotationInputs, RotationOutcome, rotate_credentials};
use mongodb_operator::crd::{CredentialPolicy, CredentialStatus, RotationStep};
use mongodb_operator::resources::ClusterKey;
use mongodb_operator::resources::secret::{PendingCredential, StoredCredential};

use crate::common::*;

const PRIMARY: &str = "demo-rs0-0-0";

fn policy(generation: i64, cached: bool) -> CredentialPolicy {
    MongoClusterBuilder::new("demo", "db")
        .with_replica_set("rs0", 3)
        .with_user("app", generation, cached)
        .build()
        .spec
        .credentials
        .unwrap()
}

/// What one rotation pass sees besides the policy
struct Targets {
    targets: Vec<String>,
    missing: Vec<String>,
    cache_pods: Vec<String>,
    restarts_pending: bool,
}

impl Default for Targets {
    fn default() -> Self {
        Self {
            targets: vec![PRIMARY.to_string()],
            missing: Vec::new(),
            cache_pods: (0..3).map(|i| format!("demo-rs0-{}-0", i)).collect(),
            restarts_pending: false,
        }
    }
}

async fn rotate(
    fake: &FakeCluster,
    policy: Option<&CredentialPolicy>,
    targets: &Targets,
    current: &BTreeMap<String, CredentialStatus>,
) -> RotationOutcome {
    let key = ClusterKey::new("db", "demo");
    let inputs = RotationInputs {
        key: &key,
        policy,
        targets: &targets.targets,
        missing_targets: &targets.missing,
        cache_pods: &targets.cache_pods,
        restarts_pending: targets.restarts_pending,
        timeout: Duration::from_secs(1),
    };
    rotate_credentials(fake, fake, &inputs, current).await
}

fn app(outcome: &RotationOutcome) -> &CredentialStatus {
    &outcome.statuses["app"]
}

fn status(generation: i64, step: RotationStep, target: Option<i64>) -> BTreeMap<String, CredentialStatus> {
    BTreeMap::from([(
        "app".to_string(),
        CredentialStatus {
            generation,
            target_generation: target,
            step,
            message: None,
        },
    )])
}

mod sequence_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_rotation_walks_every_step() {
        let fake = FakeCluster::new("demo");
        let policy = policy(1, false);
        let targets = Targets::default();
        let mut current = BTreeMap::new();
        let mut steps = Vec::new();

        for _ in 0..7 {
            let outcome = rotate(&fake, Some(&policy), &targets, &current).await;
            assert!(outcome.errors.is_empty());
            assert!(outcome.restarts.is_empty());
            steps.push(app(&outcome).step);
            current = outcome.statuses;
        }

        assert_eq!(
            steps,
            vec![
                RotationStep::Idle,
                RotationStep::PendingStored,
                RotationStep::Applied,
                RotationStep::Stored,
                RotationStep::Revoked,
                RotationStep::Idle,
                RotationStep::Idle,
            ]
        );
        assert_eq!(current["app"].generation, 1);
        assert_eq!(
            fake.world().calls,
            vec![
                "write_pending app 1".to_string(),
                format!("upsert_user app on {}", PRIMARY),
                "promote app 1".to_string(),
                format!("revoke app on {}", PRIMARY),
            ]
        );

        let world = fake.world();
        let stored = &world.credentials["app"];
        assert_eq!(stored.generation, Some(1));
        assert_eq!(stored.password.as_ref(), world.db_passwords.get("app"));
    }

    #[tokio::test]
    async fn test_cached_user_restarts_members() {
        let fake = FakeCluster::new("demo");
        let policy = policy(1, true);
        let mut targets = Targets::default();

        let outcome = rotate(&fake, Some(&policy), &targets, &status(0, RotationStep::Revoked, Some(1))).await;
        assert_eq!(app(&outcome).step, RotationStep::Restarting);
        assert_eq!(outcome.restarts, targets.cache_pods);

        targets.restarts_pending = true;
        let waiting = rotate(&fake, Some(&policy), &targets, &outcome.statuses).await;
        assert_eq!(app(&waiting).step, RotationStep::Restarting);
        assert!(waiting.restarts.is_empty());

        targets.restarts_pending = false;
        let done = rotate(&fake, Some(&policy), &targets, &waiting.statuses).await;
        assert_eq!(app(&done).step, RotationStep::Idle);
        assert_eq!(app(&done).generation, 1);
    }

    #[tokio::test]
    async fn test_existing_credential_is_adopted() {
        let fake = FakeCluster::new("demo");
        fake.world().credentials.insert(
            "app".to_string(),
            StoredCredential {
                password: Some("secret".to_string()),
                generation: Some(3),
                pending: None,
            },
        );
        let policy = policy(2, false);

        let outcome = rotate(&fake, Some(&policy), &Targets::default(), &BTreeMap::new()).await;
        assert_eq!(app(&outcome).generation, 3);

        let next = rotate(&fake, Some(&policy), &Targets::default(), &outcome.statuses).await;
        assert_eq!(app(&next).step, RotationStep::Idle);
        assert!(fake.world().calls.is_empty());
    }

    #[tokio::test]
    async fn test_no_policy_no_statuses() {
        let fake = FakeCluster::new("demo");
        let outcome = rotate(&fake, None, &Targets::default(), &BTreeMap::new()).await;
        assert!(outcome.statuses.is_empty());
        assert!(!outcome.in_progress());
    }
}

mod recovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_waits_for_missing_primary() {
        let fake = FakeCluster::new("demo");
        let policy = policy(1, false);
        let targets = Targets {
            missing: vec!["rs1".to_string()],
            ..Default::default()
        };

        let outcome = rotate(&fake, Some(&policy), &targets, &status(0, RotationStep::Idle, None)).await;
        assert_eq!(app(&outcome).step, RotationStep::Idle);
        assert_eq!(app(&outcome).message.as_deref(), Some("waiting for a primary on rs1"));
        assert!(fake.world().calls.is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_keeps_step_and_old_password() {
        let fake = FakeCluster::new("demo");
        fake.world().db_passwords.insert("app".to_string(), "old".to_string());
        let policy = policy(1, false);
        let targets = Targets::default();

        let stored = rotate(&fake, Some(&policy), &targets, &status(0, RotationStep::Idle, None)).await;
        assert_eq!(app(&stored).step, RotationStep::PendingStored);

        fake.fail_next("upsert_user", 1);
        let failed = rotate(&fake, Some(&policy), &targets, &stored.statuses).await;
        assert_eq!(app(&failed).step, RotationStep::PendingStored);
        assert!(app(&failed).message.as_deref().unwrap().contains("step failed"));
        assert_eq!(failed.errors.len(), 1);
        assert_eq!(fake.world().db_passwords["app"], "old");

        let applied = rotate(&fake, Some(&policy), &targets, &failed.statuses).await;
        assert_eq!(app(&applied).step, RotationStep::Applied);
        let world = fake.world();
        let pending = world.credentials["app"].pending.as_ref().unwrap();
        assert_eq!(world.db_passwords["app"], pending.password);
    }

    /// A pass that wrote the pending credential but lost its status resumes with
    /// the same password instead of generating another one
    #[tokio::test]
    async fn test_pending_written_by_lost_pass_is_reused() {
        let fake = FakeCluster::new("demo");
        fake.world().credentials.insert(
            "app".to_string(),
            StoredCredential {
                password: None,
                generation: None,
                pending: Some(PendingCredential {
                    generation: 1,
                    password: "from-lost-pass".to_string(),
                }),
            },
        );
        let policy = policy(1, false);
        let targets = Targets::default();

        let outcome = rotate(&fake, Some(&policy), &targets, &status(-1, RotationStep::Idle, None)).await;
        assert_eq!(app(&outcome).step, RotationStep::PendingStored);
        assert!(fake.calls("write_pending").is_empty());

        rotate(&fake, Some(&policy), &targets, &outcome.statuses).await;
        assert_eq!(fake.world().db_passwords["app"], "from-lost-pass");
    }

    #[tokio::test]
    async fn test_vanished_pending_returns_to_idle() {
        let fake = FakeCluster::new("demo");
        let policy = policy(1, false);

        let outcome = rotate(
            &fake,
            Some(&policy),
            &Targets::default(),
            &status(0, RotationStep::PendingStored, Some(1)),
        )
        .await;
        assert_eq!(app(&outcome).step, RotationStep::Idle);
        assert_eq!(app(&outcome).target_generation, None);
        assert!(fake.calls("upsert_user").is_empty());
    }

    #[tokio::test]
    async fn test_promote_already_done_is_detected() {
        let fake = FakeCluster::new("demo");
        fake.world().credentials.insert(
            "app".to_string(),
            StoredCredential {
                password: Some("new".to_string()),
                generation: Some(1),
                pending: None,
            },
        );
        let policy = policy(1, false);

        let outcome = rotate(
            &fake,
            Some(&policy),
            &Targets::default(),
            &status(0, RotationStep::PendingStored, Some(1)),
        )
        .await;
        assert_eq!(app(&outcome).step, RotationStep::Stored);
        assert!(fake.calls("upsert_user").is_empty());
    }

    /// An engine holding one password per user drops the old one on apply, so the
    /// new one is made active in the store within the same step
    #[tokio::test]
    async fn test_single_credential_engine_promotes_on_apply() {
        let fake = FakeCluster::new("demo");
        fake.world().single_credential = true;
        let policy = policy(1, false);
        let targets = Targets::default();

        let stored = rotate(&fake, Some(&policy), &targets, &status(0, RotationStep::Idle, None)).await;
        let applied = rotate(&fake, Some(&policy), &targets, &stored.statuses).await;
        assert!(applied.errors.is_empty());
        assert_eq!(app(&applied).step, RotationStep::Stored);
        assert_eq!(fake.calls("promote"), vec!["promote app 1".to_string()]);

        let revoked = rotate(&fake, Some(&policy), &targets, &applied.statuses).await;
        assert_eq!(app(&revoked).step, RotationStep::Revoked);
        assert!(fake.calls("revoke").is_empty());

        let world = fake.world();
        assert_eq!(world.credentials["app"].password.as_ref(), world.db_passwords.get("app"));
    }

    #[tokio::test]
    async fn test_single_credential_engine_retries_only_promote() {
        let fake = FakeCluster::new("demo");
        fake.world().single_credential = true;
        let policy = policy(1, false);
        let targets = Targets::default();

        let stored = rotate(&fake, Some(&policy), &targets, &status(0, RotationStep::Idle, None)).await;
        fake.fail_next("promote", 3);
        let mut current = stored.statuses;
        for _ in 0..3 {
            let outcome = rotate(&fake, Some(&policy), &targets, &current).await;
            assert_eq!(app(&outcome).step, RotationStep::Applied);
            assert_eq!(outcome.errors.len(), 1);
            {
                // The password the database holds is still the pending one in the store
                let world = fake.world();
                let pending = world.credentials["app"].pending.as_ref().map(|p| &p.password);
                assert_eq!(pending, world.db_passwords.get("app"));
            }
            current = outcome.statuses;
        }
        assert_eq!(fake.calls("upsert_user").len(), 1);

        let promoted = rotate(&fake, Some(&policy), &targets, &current).await;
        assert!(promoted.errors.is_empty());
        assert_eq!(app(&promoted).step, RotationStep::Stored);
        let world = fake.world();
        assert_eq!(world.credentials["app"].password.as_ref(), world.db_passwords.get("app"));
        assert!(world.credentials["app"].pending.is_none());
    }

    #[tokio::test]
    async fn test_store_read_failure_is_reported() {
        let fake = FakeCluster::new("demo");
        fake.fail_next("read", 1);
        let policy = policy(1, false);

        let outcome = rotate(&fake, Some(&policy), &Targets::default(), &BTreeMap::new()).await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].is_retryable());
        assert!(!outcome.statuses.contains_key("app"));

        let retried = rotate(&fake, Some(&policy), &Targets::default(), &outcome.statuses).await;
        assert!(retried.errors.is_empty());
        assert_eq!(app(&retried).generation, -1);
    }
}
