//! Platform workload client
//!
//! [`Platform`] is the controller's view of the orchestration platform: list the
//! member workloads of a cluster and create, update, restart or delete one of them.
//! Every call is idempotent. [`KubePlatform`] implements it with one single-replica
//! StatefulSet per member, applied with server-side apply.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::controller::topology::{MemberId, ObservedMember};
use crate::crd::MongoCluster;
use crate::resources::admin::MONGOD_CONTAINER;
use crate::resources::common::{
    CLUSTER_LABEL, CONFIG_HASH_ANNOTATION, FIELD_MANAGER, ORDINAL_LABEL, REPLSET_LABEL,
    RESTARTED_AT_ANNOTATION,
};
use crate::resources::workload::{
    MemberTemplate, generate_headless_service, generate_member_statefulset, generate_system_secrets,
};

/// Errors from the platform client
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("platform call timed out")]
    Timeout,
}

impl PlatformError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::Kube(kube::Error::Api(api_err)) => {
                !(400..500).contains(&api_err.code) || api_err.code == 409 || api_err.code == 429
            }
            _ => true,
        }
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Every member and router workload of the cluster
    async fn list_members(&self, cluster: &MongoCluster) -> Result<Vec<ObservedMember>, PlatformError>;

    async fn create_member(&self, cluster: &MongoCluster, member: &MemberTemplate) -> Result<(), PlatformError>;

    async fn update_member(&self, cluster: &MongoCluster, member: &MemberTemplate) -> Result<(), PlatformError>;

    async fn delete_member(&self, cluster: &MongoCluster, member: &MemberId) -> Result<(), PlatformError>;

    /// Restart the member process without changing its template
    async fn restart_member(&self, cluster: &MongoCluster, member: &MemberId) -> Result<(), PlatformError>;

    /// Whether the cluster object is being deleted (or already gone)
    async fn deletion_requested(&self, cluster: &MongoCluster) -> Result<bool, PlatformError>;
}

/// [`Platform`] backed by StatefulSets in the cluster namespace
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Apply a Kubernetes resource using server-side apply
    async fn apply<T>(&self, ns: &str, resource: &T) -> Result<(), PlatformError>
    where
        T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
        <T as kube::Resource>::DynamicType: Default,
    {
        let api: Api<T> = Api::namespaced(self.client.clone(), ns);
        let name = resource.name_any();
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(resource)).await?;
        debug!("Applied resource: {}", name);
        Ok(())
    }

    /// Create the admin and keyfile Secrets once; they are never rewritten
    async fn ensure_system_secrets(&self, cluster: &MongoCluster, ns: &str) -> Result<(), PlatformError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        for secret in generate_system_secrets(cluster) {
            let name = secret.name_any();
            if api.get_opt(&name).await?.is_some() {
                continue;
            }
            match api.create(&PostParams::default(), &secret).await {
                Ok(_) => debug!("Created secret: {}", name),
                Err(kube::Error::Api(resp)) if resp.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Translate a member StatefulSet into an observed member
pub fn observe_statefulset(sts: &StatefulSet) -> Option<ObservedMember> {
    let labels = sts.metadata.labels.as_ref()?;
    let replset = labels.get(REPLSET_LABEL)?;
    let ordinal = labels.get(ORDINAL_LABEL)?.parse::<i32>().ok()?;

    let image = sts
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == MONGOD_CONTAINER))
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    let config_hash = sts
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONFIG_HASH_ANNOTATION))
        .cloned()
        .unwrap_or_default();

    let generation = sts.metadata.generation.unwrap_or_default();
    let ready = sts.status.as_ref().is_some_and(|s| {
        s.ready_replicas.unwrap_or(0) >= 1
            && s.observed_generation.unwrap_or_default() >= generation
            && s.current_revision.is_some()
            && s.current_revision == s.update_revision
    });

    Some(ObservedMember {
        id: MemberId::new(replset.clone(), ordinal),
        image,
        config_hash,
        ready,
        terminating: sts.metadata.deletion_timestamp.is_some(),
    })
}

#[async_trait]
impl Platform for KubePlatform {
    async fn list_members(&self, cluster: &MongoCluster) -> Result<Vec<ObservedMember>, PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        let selector = format!("{}={}", CLUSTER_LABEL, cluster.name_any());
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items.iter().filter_map(observe_statefulset).collect())
    }

    async fn create_member(&self, cluster: &MongoCluster, member: &MemberTemplate) -> Result<(), PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        self.ensure_system_secrets(cluster, &ns).await?;
        let service: Service = generate_headless_service(cluster, &member.id.replset);
        self.apply(&ns, &service).await?;
        self.apply(&ns, &generate_member_statefulset(cluster, member)).await
    }

    async fn update_member(&self, cluster: &MongoCluster, member: &MemberTemplate) -> Result<(), PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        self.apply(&ns, &generate_member_statefulset(cluster, member)).await
    }

    async fn delete_member(&self, cluster: &MongoCluster, member: &MemberId) -> Result<(), PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        let name = member.workload_name(&cluster.name_any());
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restart_member(&self, cluster: &MongoCluster, member: &MemberId) -> Result<(), PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &ns);
        let name = member.workload_name(&cluster.name_any());
        let patch = serde_json::json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339()
            } } } }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn deletion_requested(&self, cluster: &MongoCluster) -> Result<bool, PlatformError> {
        let ns = cluster.namespace().unwrap_or_default();
        let api: Api<MongoCluster> = Api::namespaced(self.client.clone(), &ns);
        let meta = api.get_metadata_opt(&cluster.name_any()).await?;
        Ok(meta.is_none_or(|m| m.metadata.deletion_timestamp.is_some()))
    }
}
