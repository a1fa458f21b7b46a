//! Common utilities for Kubernetes resource generation
//!
//! Shared constants, labels and naming helpers used by every collaborator
//! that talks to the platform.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::MongoCluster;

/// API version for MongoCluster CRD
pub const API_VERSION: &str = "mongodb.example.com/v1alpha1";

/// Kind for MongoCluster CRD
pub const KIND: &str = "MongoCluster";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "mongodb-operator";

/// Label carrying the cluster name
pub const CLUSTER_LABEL: &str = "mongodb.example.com/cluster";

/// Label carrying the replica set name (or the router tier)
pub const REPLSET_LABEL: &str = "mongodb.example.com/replset";

/// Label carrying the member ordinal inside its replica set
pub const ORDINAL_LABEL: &str = "mongodb.example.com/ordinal";

/// Annotation carrying the fingerprint of the member's configuration
pub const CONFIG_HASH_ANNOTATION: &str = "mongodb.example.com/config-hash";

/// Pod template annotation bumped to force a restart
pub const RESTARTED_AT_ANNOTATION: &str = "mongodb.example.com/restarted-at";

/// Port every mongod and mongos listens on
pub const MONGODB_PORT: i32 = 27017;

/// Identity of a cluster, independent of the Kubernetes object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_cluster(cluster: &MongoCluster) -> Self {
        Self::new(cluster.namespace().unwrap_or_default(), cluster.name_any())
    }

    /// Headless service resolving members of one replica set
    pub fn headless_service(&self, replset: &str) -> String {
        format!("{}-{}", self.name, replset)
    }

    /// Stable DNS host of a member pod
    pub fn member_host(&self, replset: &str, pod: &str) -> String {
        format!(
            "{}.{}.{}.svc.cluster.local:{}",
            pod,
            self.headless_service(replset),
            self.namespace,
            MONGODB_PORT
        )
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Generate an owner reference for a MongoCluster
///
/// All child resources are owned by the cluster and are garbage collected
/// when it is deleted.
pub fn owner_reference(cluster: &MongoCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a MongoCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "mongodb".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels selecting every workload of one replica set
pub fn replset_labels(cluster_name: &str, replset: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(REPLSET_LABEL.to_string(), replset.to_string());
    labels
}

/// Labels identifying a single member workload
pub fn member_labels(cluster_name: &str, replset: &str, ordinal: i32) -> BTreeMap<String, String> {
    let mut labels = replset_labels(cluster_name, replset);
    labels.insert(ORDINAL_LABEL.to_string(), ordinal.to_string());
    labels
}
