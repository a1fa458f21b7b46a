pub mod admin;
pub mod agent;
pub mod common;
pub mod exec;
pub mod platform;
pub mod secret;
pub mod workload;

pub use admin::{DatabaseAdmin, MongoshAdmin};
pub use agent::{BackupAgent, PbmAgent};
pub use common::{API_VERSION, ClusterKey, FIELD_MANAGER, KIND, owner_reference, standard_labels};
pub use platform::{KubePlatform, Platform};
pub use secret::{CredentialStore, SecretStore};
