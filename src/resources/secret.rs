//! Credential storage
//!
//! Managed user credentials live in a Secret. Each user has an active password
//! and generation plus, during rotation, a pending password and generation:
//!
//! | key                           | value                          |
//! |-------------------------------|--------------------------------|
//! | `<user>`                      | active password                |
//! | `<user>.generation`           | active generation              |
//! | `<user>.pending`              | pending password               |
//! | `<user>.pending-generation`   | pending generation             |

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use rand::Rng;

use crate::resources::common::{ClusterKey, FIELD_MANAGER, standard_labels};

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 32;

/// Errors from the credential store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("malformed credential entry {key} in secret {secret}")]
    Malformed { secret: String, key: String },

    #[error("credential store call timed out")]
    Timeout,
}

/// A credential not yet promoted to active
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCredential {
    pub generation: i64,
    pub password: String,
}

/// Stored credential of one user
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct StoredCredential {
    /// Active password, absent until the first rotation is promoted
    pub password: Option<String>,
    pub generation: Option<i64>,
    pub pending: Option<PendingCredential>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn read(&self, cluster: &ClusterKey, secret: &str, user: &str) -> Result<StoredCredential, StoreError>;

    /// Durably record `password` as the pending credential of `user`
    async fn write_pending(
        &self,
        cluster: &ClusterKey,
        secret: &str,
        user: &str,
        generation: i64,
        password: &str,
    ) -> Result<(), StoreError>;

    /// Make the pending credential of `generation` the active one
    async fn promote(&self, cluster: &ClusterKey, secret: &str, user: &str, generation: i64) -> Result<(), StoreError>;
}

/// Generate a secure random password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn generation_key(user: &str) -> String {
    format!("{}.generation", user)
}

fn pending_key(user: &str) -> String {
    format!("{}.pending", user)
}

fn pending_generation_key(user: &str) -> String {
    format!("{}.pending-generation", user)
}

/// Decode the entry of one user from Secret data
pub fn parse_credential(
    secret: &str,
    data: &BTreeMap<String, ByteString>,
    user: &str,
) -> Result<StoredCredential, StoreError> {
    let text = |key: &str| -> Result<Option<String>, StoreError> {
        data.get(key)
            .map(|v| {
                String::from_utf8(v.0.clone()).map_err(|_| StoreError::Malformed {
                    secret: secret.to_string(),
                    key: key.to_string(),
                })
            })
            .transpose()
    };
    let number = |key: &str| -> Result<Option<i64>, StoreError> {
        text(key)?
            .map(|v| {
                v.trim().parse::<i64>().map_err(|_| StoreError::Malformed {
                    secret: secret.to_string(),
                    key: key.to_string(),
                })
            })
            .transpose()
    };

    let pending = match (text(&pending_key(user))?, number(&pending_generation_key(user))?) {
        (Some(password), Some(generation)) => Some(PendingCredential {
            generation,
            password,
        }),
        _ => None,
    };

    Ok(StoredCredential {
        password: text(user)?,
        generation: number(&generation_key(user))?,
        pending,
    })
}

/// [`CredentialStore`] backed by a Secret in the cluster namespace
#[derive(Clone)]
pub struct SecretStore {
    client: Client,
}

impl SecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_data(
        &self,
        cluster: &ClusterKey,
        secret: &str,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace);
        if api.get_opt(secret).await?.is_none() {
            let empty = Secret {
                metadata: ObjectMeta {
                    name: Some(secret.to_string()),
                    namespace: Some(cluster.namespace.clone()),
                    labels: Some(standard_labels(&cluster.name)),
                    ..Default::default()
                },
                type_: Some("Opaque".to_string()),
                ..Default::default()
            };
            match api.create(&PostParams::default(), &empty).await {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }

        let patch = serde_json::json!({ "data": data });
        api.patch(secret, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn encoded(value: &str) -> ByteString {
    ByteString(value.as_bytes().to_vec())
}

#[async_trait]
impl CredentialStore for SecretStore {
    async fn read(&self, cluster: &ClusterKey, secret: &str, user: &str) -> Result<StoredCredential, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace);
        match api.get_opt(secret).await? {
            Some(s) => parse_credential(secret, &s.data.unwrap_or_default(), user),
            None => Ok(StoredCredential::default()),
        }
    }

    async fn write_pending(
        &self,
        cluster: &ClusterKey,
        secret: &str,
        user: &str,
        generation: i64,
        password: &str,
    ) -> Result<(), StoreError> {
        let data = serde_json::json!({
            pending_key(user): encoded(password),
            pending_generation_key(user): encoded(&generation.to_string()),
        });
        self.patch_data(cluster, secret, data).await
    }

    async fn promote(&self, cluster: &ClusterKey, secret: &str, user: &str, generation: i64) -> Result<(), StoreError> {
        let current = self.read(cluster, secret, user).await?;
        let Some(pending) = current.pending.filter(|p| p.generation == generation) else {
            // Already promoted, or nothing to promote; the caller confirms by read-back
            return Ok(());
        };
        let data = serde_json::json!({
            user: encoded(&pending.password),
            generation_key(user): encoded(&generation.to_string()),
            pending_key(user): null,
            pending_generation_key(user): null,
        });
        self.patch_data(cluster, secret, data).await
    }
}
