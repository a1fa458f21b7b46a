pub mod backup;
pub mod cleanup;
pub mod context;
pub mod credentials;
pub mod error;
pub mod member_health;
pub mod reconciler;
pub mod restore;
pub mod rollout;
pub mod status;
pub mod topology;
pub mod validation;

pub use context::{Collaborators, Context, OperatorConfig};
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, PassOutcome, error_policy, reconcile, run_pass};
pub use status::{ConditionBuilder, StatusInputs, StatusManager, aggregate};
pub use topology::{ROUTER_SET, TopologyDiff, TopologyGraph, compute_diff, desired_topology};
pub use validation::{MAX_MEMBERS, MIN_MEMBERS, validate_spec};
