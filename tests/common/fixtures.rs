//! Test fixtures and builder patterns for workloads and managed VPAs.

use std::collections::BTreeMap;

use autovpa::vpa;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::api::DynamicObject;
use serde_json::{Value, json};

/// Annotation/label keys used throughout the tests.
pub const PROFILE_KEY: &str = "autovpa.containeroo.ch/profile";
pub const MANAGED_LABEL: &str = "autovpa.containeroo.ch/managed";

/// Builder for Deployment test fixtures.
///
/// # Example
/// ```ignore
/// let dep = DeploymentBuilder::new("demo")
///     .namespace("ns1")
///     .profile("default")
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct DeploymentBuilder {
    name: String,
    namespace: String,
    uid: String,
    annotations: BTreeMap<String, String>,
    terminating: bool,
}

impl DeploymentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".into(),
            uid: "uid-1".into(),
            annotations: BTreeMap::new(),
            terminating: false,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = uid.into();
        self
    }

    /// Opt the workload into the given profile.
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.annotations.insert(PROFILE_KEY.into(), profile.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn terminating(mut self) -> Self {
        self.terminating = true;
        self
    }

    pub fn build(self) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some(self.uid),
                annotations: (!self.annotations.is_empty()).then_some(self.annotations),
                deletion_timestamp: self
                    .terminating
                    .then(|| Time(k8s_openapi::chrono::Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Builder for managed-VPA test fixtures.
#[derive(Clone, Debug)]
pub struct VpaBuilder {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
    owners: Vec<OwnerReference>,
    spec: Value,
}

impl VpaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".into(),
            labels: BTreeMap::new(),
            owners: Vec::new(),
            spec: json!({}),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Mark as managed and carrying the given profile label.
    pub fn managed(mut self, profile: impl Into<String>) -> Self {
        self.labels.insert(MANAGED_LABEL.into(), "true".into());
        self.labels.insert(PROFILE_KEY.into(), profile.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a controller owner reference to a workload.
    pub fn controlled_by(mut self, kind: &str, name: &str, uid: &str) -> Self {
        self.owners.push(OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        self
    }

    pub fn spec(mut self, spec: Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn build(self) -> DynamicObject {
        let mut obj = vpa::new_vpa(&self.name, &self.namespace);
        if !self.labels.is_empty() {
            obj.metadata.labels = Some(self.labels);
        }
        if !self.owners.is_empty() {
            obj.metadata.owner_references = Some(self.owners);
        }
        obj.data = json!({ "spec": self.spec });
        obj
    }
}
