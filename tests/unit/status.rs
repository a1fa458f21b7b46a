//! Unit tests for status aggregation and conditions

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mongodb_operator::controller::status::{condition_status, condition_types};
use mongodb_operator::controller::{ConditionBuilder, Error, StatusInputs, aggregate};
use mongodb_operator::crd::{
    BackupSummary, ClusterPhase, Condition, CredentialStatus, MongoClusterStatus, ReplicaSetStatus,
    RestorePhase, RestoreStatus, RolloutPhase, RolloutState, RotationStep, RouterStatus,
};

fn serving(size: i32) -> ReplicaSetStatus {
    ReplicaSetStatus {
        size,
        ready: size,
        primary: Some("demo-rs0-0-0".to_string()),
        initialized: true,
        ..Default::default()
    }
}

fn inputs<'a>(now: DateTime<Utc>) -> StatusInputs<'a> {
    StatusInputs {
        generation: Some(1),
        replica_sets: BTreeMap::from([("rs0".to_string(), serving(3))]),
        now,
        ..Default::default()
    }
}

fn condition<'a>(status: &'a MongoClusterStatus, type_: &str) -> &'a Condition {
    status.conditions.iter().find(|c| c.type_ == type_).unwrap()
}

mod condition_builder_tests {
    use super::*;

    #[test]
    fn test_empty_builder() {
        let conditions = ConditionBuilder::from_existing(Vec::new(), Some(1), Utc::now()).build();
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_set_condition_adds_new() {
        let conditions = ConditionBuilder::from_existing(Vec::new(), Some(4), Utc::now())
            .set_condition("Custom", condition_status::UNKNOWN, "Probing", "not yet known")
            .build();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Custom");
        assert_eq!(conditions[0].status, condition_status::UNKNOWN);
        assert_eq!(conditions[0].observed_generation, Some(4));
    }

    #[test]
    fn test_set_condition_updates_in_place() {
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        let first = ConditionBuilder::from_existing(Vec::new(), Some(1), earlier)
            .ready(false, "Initializing", "starting")
            .degraded(false, "Healthy", "fine")
            .build();
        let now = Utc::now();
        let second = ConditionBuilder::from_existing(first.clone(), Some(2), now)
            .ready(true, "ClusterReady", "serving")
            .build();

        assert_eq!(second.len(), 2);
        let ready = second.iter().find(|c| c.type_ == condition_types::READY).unwrap();
        assert_eq!(ready.status, condition_status::TRUE);
        assert_eq!(ready.last_transition_time, now.to_rfc3339());
        assert_eq!(ready.observed_generation, Some(2));
        // Untouched conditions keep their state
        let degraded = second.iter().find(|c| c.type_ == condition_types::DEGRADED).unwrap();
        assert_eq!(degraded, &first[1]);
    }

    #[test]
    fn test_all_standard_conditions() {
        let conditions = ConditionBuilder::from_existing(Vec::new(), None, Utc::now())
            .ready(true, "r", "")
            .progressing(false, "p", "")
            .degraded(false, "d", "")
            .config_valid(true, "c", "")
            .backup_healthy(true, "b", "")
            .build();
        let types: Vec<&str> = conditions.iter().map(|c| c.type_.as_str()).collect();
        assert_eq!(
            types,
            vec![
                condition_types::READY,
                condition_types::PROGRESSING,
                condition_types::DEGRADED,
                condition_types::CONFIG_VALID,
                condition_types::BACKUP_HEALTHY,
            ]
        );
    }
}

mod phase_tests {
    use super::*;

    #[test]
    fn test_no_replica_sets_is_not_ready() {
        let status = aggregate(StatusInputs {
            now: Utc::now(),
            ..Default::default()
        });
        assert_eq!(status.phase, ClusterPhase::Initializing);
    }

    #[test]
    fn test_rotation_in_progress_holds_ready() {
        let mut input = inputs(Utc::now());
        input.credentials.insert(
            "app".to_string(),
            CredentialStatus {
                step: RotationStep::Applied,
                ..Default::default()
            },
        );
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Initializing);
        let progressing = condition(&status, condition_types::PROGRESSING);
        assert_eq!(progressing.status, condition_status::TRUE);
        assert!(progressing.message.contains("credential rotation"));
    }

    #[test]
    fn test_restore_in_progress_holds_ready() {
        let mut input = inputs(Utc::now());
        input.restore = Some(RestoreStatus {
            name: "r1".to_string(),
            phase: RestorePhase::Restoring,
            ..Default::default()
        });
        input.restore_requested = true;
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Initializing);
        assert!(condition(&status, condition_types::PROGRESSING).message.contains("restore"));
    }

    #[test]
    fn test_failed_restore_is_error_only_while_requested() {
        let failed = RestoreStatus {
            name: "r1".to_string(),
            phase: RestorePhase::Failed,
            error: Some("gap detected".to_string()),
            ..Default::default()
        };

        let mut input = inputs(Utc::now());
        input.restore = Some(failed.clone());
        input.restore_requested = true;
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Error);
        assert_eq!(status.last_error.as_deref(), Some("restore r1: gap detected"));
        assert_eq!(condition(&status, condition_types::READY).reason, "RestoreFailed");

        let mut input = inputs(Utc::now());
        input.restore = Some(failed);
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Ready);
    }

    #[test]
    fn test_routers_and_shards_gate_ready() {
        let mut input = inputs(Utc::now());
        input.routers = Some(RouterStatus {
            size: 2,
            ready: 1,
            rollout: RolloutState::default(),
        });
        assert_eq!(aggregate(input).phase, ClusterPhase::Initializing);

        let mut input = inputs(Utc::now());
        input.unregistered_shards = vec!["rs0".to_string()];
        assert_eq!(aggregate(input).phase, ClusterPhase::Initializing);
    }

    #[test]
    fn test_router_rollout_error_is_error() {
        let mut input = inputs(Utc::now());
        input.routers = Some(RouterStatus {
            size: 2,
            ready: 2,
            rollout: RolloutState {
                phase: RolloutPhase::Error,
                message: Some("rollout stalled".to_string()),
                ..Default::default()
            },
        });
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Error);
        assert_eq!(status.last_error.as_deref(), Some("routers: rollout stalled"));
    }

    #[test]
    fn test_cancelled_pass_is_not_error() {
        let err = Error::Cancelled("demo is being deleted".to_string());
        let mut input = inputs(Utc::now());
        input.pass_error = Some(&err);
        let status = aggregate(input);
        assert_ne!(status.phase, ClusterPhase::Error);
        assert_eq!(status.retry_count, Some(1));
    }
}

mod backup_condition_tests {
    use super::*;

    #[test]
    fn test_agent_errors_degrade_backups_not_the_cluster() {
        let mut input = inputs(Utc::now());
        input.backup_errors = vec!["b1: agent on demo-rs0-1-0 timed out".to_string()];
        let status = aggregate(input);

        assert_eq!(status.phase, ClusterPhase::Ready);
        let backup = condition(&status, condition_types::BACKUP_HEALTHY);
        assert_eq!(backup.status, condition_status::FALSE);
        assert!(backup.message.contains("timed out"));
    }

    #[test]
    fn test_backup_in_progress_is_progressing() {
        let mut input = inputs(Utc::now());
        input.backup_summary = Some(BackupSummary {
            in_progress: 1,
            ..Default::default()
        });
        let status = aggregate(input);
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(condition(&status, condition_types::PROGRESSING).status, condition_status::TRUE);
    }
}

mod history_tests {
    use super::*;

    #[test]
    fn test_phase_start_kept_while_phase_holds() {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let first = aggregate(inputs(earlier));

        let mut input = inputs(Utc::now());
        input.previous = Some(&first);
        let second = aggregate(input);
        assert_eq!(second.phase_started_at, first.phase_started_at);

        let mut input = inputs(Utc::now());
        input.previous = Some(&second);
        input.replica_sets.get_mut("rs0").unwrap().ready = 1;
        let third = aggregate(input);
        assert_ne!(third.phase_started_at, second.phase_started_at);
    }

    #[test]
    fn test_error_time_kept_for_repeated_error() {
        let err = Error::TransientError("health query timed out".to_string());
        let earlier = Utc::now() - chrono::Duration::minutes(10);
        let mut input = inputs(earlier);
        input.pass_error = Some(&err);
        let first = aggregate(input);
        assert_eq!(first.last_error_time, Some(earlier.to_rfc3339()));

        let mut input = inputs(Utc::now());
        input.previous = Some(&first);
        input.pass_error = Some(&err);
        let second = aggregate(input);
        assert_eq!(second.last_error_time, first.last_error_time);
        assert_eq!(second.retry_count, Some(2));

        let mut input = inputs(Utc::now());
        input.previous = Some(&second);
        let recovered = aggregate(input);
        assert!(recovered.last_error.is_none());
        assert!(recovered.last_error_time.is_none());
        assert_eq!(recovered.retry_count, Some(0));
    }

    #[test]
    fn test_carried_over_repeats_previous_observations() {
        let mut previous = aggregate(inputs(Utc::now()));
        previous.credentials.insert("app".to_string(), CredentialStatus::default());
        let err = Error::TransientError("member listing timed out".to_string());

        let mut input = StatusInputs::carried_over(Some(&previous), Some(2), Utc::now());
        input.pass_error = Some(&err);
        let status = aggregate(input);

        assert_eq!(status.replica_sets, previous.replica_sets);
        assert_eq!(status.credentials, previous.credentials);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.phase, ClusterPhase::Ready);
        assert_eq!(status.retry_count, Some(1));
    }
}
