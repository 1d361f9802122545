//! Workload kind descriptors.
//!
//! The operator manages VPAs for three workload kinds. Each reconciler is a
//! thin typed front; everything downstream of the fetch operates on
//! [`WorkloadFacts`], a view containing only the fields VPA derivation
//! depends on.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::controller::error::Error;

/// The workload kinds the operator watches, all in `apps/v1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    /// All supported kinds, in registration order.
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
    ];

    /// Kubernetes kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    /// Group/version string used in `targetRef` and owner references.
    pub fn api_version(&self) -> &'static str {
        "apps/v1"
    }

    /// Controller identity for logs and the error counter.
    pub fn controller_name(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }

    /// Parse an owner-reference kind. Returns `None` for unsupported kinds.
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Ties a typed `apps/v1` resource to its kind descriptor.
///
/// The shared reconcile routine is generic over this trait; the three
/// implementations below are the only ones.
pub trait Workload:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;
}

/// The slice of a workload the reconcile routine depends on.
#[derive(Clone, Debug)]
pub struct WorkloadFacts {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub kind: WorkloadKind,
    pub annotations: BTreeMap<String, String>,
    pub terminating: bool,
}

impl WorkloadFacts {
    /// Extract facts from a fetched workload object.
    ///
    /// A workload read from the API server always carries namespace and uid;
    /// their absence is a malformed response, not a user error.
    pub fn from_resource<K: Workload>(obj: &K) -> Result<Self, Error> {
        let namespace = obj
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let uid = obj.uid().ok_or(Error::MissingObjectKey("metadata.uid"))?;

        Ok(Self {
            namespace,
            name: obj.name_any(),
            uid,
            kind: K::KIND,
            annotations: obj.annotations().clone(),
            terminating: obj.meta().deletion_timestamp.is_some(),
        })
    }

    /// The profile annotation value, if present and non-empty.
    pub fn profile_annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
