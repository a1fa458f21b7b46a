// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for the MongoDB operator
//!
//! This module contains unit tests for:
//! - Topology diffing and member health probing
//! - Rollout ordering and quorum gating
//! - Backup, restore and credential rotation state machines
//! - Status aggregation and validation
//! - Whole reconcile passes against in-memory collaborators

#[path = "../common/mod.rs"]
mod common;

mod credentials;
mod rollout;
mod scenarios;
mod status;
