// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice,
    dead_code
)]

//! Common test utilities and fixtures shared across all test targets
//!
//! This module provides builders for MongoCluster resources and in-memory
//! collaborators that stand in for the platform, the database, the backup agent
//! and the credential store. It is shared between unit tests and property tests.
//!
//! # Usage
//!
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```


pub use fakes::*;
pub use fixtures::*;

use chrono::{DateTime, Utc};
use mongodb_operator::controller::{PassOutcome, run_pass};
use mongodb_operator::crd::MongoCluster;

/// Run one pass and persist its status on `cluster`, as the status write would
pub async fn pass(cluster: &mut MongoCluster, fake: &FakeCluster, now: DateTime<Utc>) -> PassOutcome {
    let outcome = run_pass(cluster, &fake.collaborators(), &test_config(), now).await;
    cluster.status = Some(outcome.status.clone());
    outcome
}

/// Run passes until `done` holds or `limit` passes ran; returns the number run
pub async fn converge(
    cluster: &mut MongoCluster,
    fake: &FakeCluster,
    limit: usize,
    done: impl Fn(&MongoCluster) -> bool,
) -> usize {
    let now = Utc::now();
    for i in 0..limit {
        if done(cluster) {
            return i;
        }
        pass(cluster, fake, now).await;
    }
    limit
}
