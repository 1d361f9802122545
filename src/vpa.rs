//! Managed-VPA helpers.
//!
//! The VerticalPodAutoscaler CRD is third-party, so managed VPAs are handled
//! as [`DynamicObject`]s: labels and owner references through typed metadata,
//! the spec as loose JSON. Everything that touches a VPA goes through this
//! module so the field-manager identity, the managed-label selector and the
//! equality rules stay in one place.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;

use crate::workload::{WorkloadFacts, WorkloadKind};

pub const VPA_GROUP: &str = "autoscaling.k8s.io";
pub const VPA_VERSION: &str = "v1";
pub const VPA_KIND: &str = "VerticalPodAutoscaler";

/// Field manager identity for every server-side apply the operator issues.
pub const FIELD_MANAGER: &str = "autovpa";

/// `ApiResource` descriptor for the dynamic VPA API.
pub fn vpa_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(VPA_GROUP, VPA_VERSION, VPA_KIND))
}

/// Namespaced dynamic API for VPAs.
pub fn vpa_api(client: Client, namespace: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client, namespace, &vpa_api_resource())
}

/// An empty VPA object with type metadata set.
pub fn new_vpa(name: &str, namespace: &str) -> DynamicObject {
    DynamicObject::new(name, &vpa_api_resource()).within(namespace)
}

/// Server-side apply under the operator's field manager.
///
/// `force` reclaims fields other managers may have taken over, which is what
/// makes tampered labels and specs snap back. Any `managedFields` on the
/// object are stripped first; the API server rejects apply payloads that
/// carry them.
pub async fn apply(
    api: &Api<DynamicObject>,
    vpa: &DynamicObject,
) -> Result<DynamicObject, kube::Error> {
    let mut obj = vpa.clone();
    obj.metadata.managed_fields = None;

    let name = obj.name_any();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&obj),
    )
    .await
}

/// List the managed VPAs in a namespace (label selector `managed_label=true`).
pub async fn list_managed(
    api: &Api<DynamicObject>,
    managed_label: &str,
) -> Result<Vec<DynamicObject>, kube::Error> {
    let params = ListParams::default().labels(&format!("{managed_label}=true"));
    Ok(api.list(&params).await?.items)
}

/// Delete a VPA, treating NotFound as success.
pub async fn delete(api: &Api<DynamicObject>, name: &str) -> Result<(), kube::Error> {
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether the VerticalPodAutoscaler CRD is served by the cluster.
///
/// Used once at startup; running without the CRD would leave every reconcile
/// failing with NotFound.
pub async fn crd_installed(client: &Client) -> Result<bool, kube::Error> {
    match kube::discovery::group(client, VPA_GROUP).await {
        Ok(group) => Ok(group
            .versioned_resources(VPA_VERSION)
            .iter()
            .any(|(res, _)| res.kind == VPA_KIND)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether the VPA carries the managed label with value `"true"`.
pub fn is_managed(vpa: &DynamicObject, managed_label: &str) -> bool {
    vpa.labels().get(managed_label).map(String::as_str) == Some("true")
}

/// The single controller owner reference, if any.
pub fn controller_owner(vpa: &DynamicObject) -> Option<&OwnerReference> {
    vpa.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// Whether the VPA's controller owner is exactly this workload (kind, name
/// and uid all match).
pub fn is_controlled_by(vpa: &DynamicObject, facts: &WorkloadFacts) -> bool {
    controller_owner(vpa).is_some_and(|r| {
        r.kind == facts.kind.kind() && r.name == facts.name && r.uid == facts.uid
    })
}

/// Whether the VPA's controller owner names this workload.
///
/// Used for cleanup after the workload is gone, when no uid is available to
/// match against.
pub fn is_owned_by_name(vpa: &DynamicObject, kind: WorkloadKind, name: &str) -> bool {
    controller_owner(vpa).is_some_and(|r| r.kind == kind.kind() && r.name == name)
}

/// The VPA spec, if present.
pub fn spec(vpa: &DynamicObject) -> Option<&Value> {
    vpa.data.get("spec")
}

/// Whether two VPAs differ on the fields the operator owns: spec, labels and
/// owner references. Server-maintained fields never enter the comparison.
pub fn needs_update(existing: &DynamicObject, applied: &DynamicObject) -> bool {
    spec(existing) != spec(applied)
        || existing.labels() != applied.labels()
        || owner_refs(existing) != owner_refs(applied)
}

fn owner_refs(vpa: &DynamicObject) -> &[OwnerReference] {
    vpa.meta().owner_references.as_deref().unwrap_or_default()
}

/// The profile label value, or `"unknown"` when absent or empty.
///
/// Only used to keep metric cardinality sane on deletion paths.
pub fn profile_from_labels<'a>(labels: &'a BTreeMap<String, String>, profile_key: &str) -> &'a str {
    labels
        .get(profile_key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner_ref(kind: &str, name: &str, uid: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: name.into(),
            uid: uid.into(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    fn facts() -> WorkloadFacts {
        WorkloadFacts {
            namespace: "ns1".into(),
            name: "demo".into(),
            uid: "uid-1".into(),
            kind: WorkloadKind::Deployment,
            annotations: BTreeMap::new(),
            terminating: false,
        }
    }

    fn vpa(labels: &[(&str, &str)], owners: Vec<OwnerReference>, spec: Value) -> DynamicObject {
        let mut obj = new_vpa("demo-vpa", "ns1");
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        if !owners.is_empty() {
            obj.metadata.owner_references = Some(owners);
        }
        obj.data = json!({ "spec": spec });
        obj
    }

    #[test]
    fn managed_label_must_be_true() {
        let managed = vpa(&[("managed", "true")], vec![], json!({}));
        let off = vpa(&[("managed", "false")], vec![], json!({}));
        let absent = vpa(&[], vec![], json!({}));
        assert!(is_managed(&managed, "managed"));
        assert!(!is_managed(&off, "managed"));
        assert!(!is_managed(&absent, "managed"));
    }

    #[test]
    fn controller_owner_skips_non_controller_refs() {
        let obj = vpa(
            &[],
            vec![
                owner_ref("Deployment", "other", "uid-9", false),
                owner_ref("Deployment", "demo", "uid-1", true),
            ],
            json!({}),
        );
        let owner = controller_owner(&obj).unwrap();
        assert_eq!(owner.name, "demo");
        assert!(controller_owner(&vpa(&[], vec![], json!({}))).is_none());
    }

    #[test]
    fn ownership_matching_requires_uid() {
        let mine = vpa(&[], vec![owner_ref("Deployment", "demo", "uid-1", true)], json!({}));
        let stale = vpa(&[], vec![owner_ref("Deployment", "demo", "uid-2", true)], json!({}));
        assert!(is_controlled_by(&mine, &facts()));
        assert!(!is_controlled_by(&stale, &facts()));
        // Name-based matching tolerates a recreated workload's new uid.
        assert!(is_owned_by_name(&stale, WorkloadKind::Deployment, "demo"));
        assert!(!is_owned_by_name(&stale, WorkloadKind::StatefulSet, "demo"));
    }

    #[test]
    fn needs_update_detects_spec_drift() {
        let owners = vec![owner_ref("Deployment", "demo", "uid-1", true)];
        let existing = vpa(
            &[("managed", "true")],
            owners.clone(),
            json!({"updatePolicy": {"updateMode": "Off"}}),
        );
        let same = existing.clone();
        let changed = vpa(
            &[("managed", "true")],
            owners,
            json!({"updatePolicy": {"updateMode": "Auto"}}),
        );
        assert!(!needs_update(&existing, &same));
        assert!(needs_update(&existing, &changed));
    }

    #[test]
    fn needs_update_detects_label_and_owner_drift() {
        let owners = vec![owner_ref("Deployment", "demo", "uid-1", true)];
        let existing = vpa(&[("managed", "true")], owners.clone(), json!({}));

        let relabeled = vpa(&[("managed", "true"), ("profile", "default")], owners, json!({}));
        assert!(needs_update(&existing, &relabeled));

        let reowned = vpa(
            &[("managed", "true")],
            vec![owner_ref("Deployment", "demo", "uid-2", true)],
            json!({}),
        );
        assert!(needs_update(&existing, &reowned));
    }

    #[test]
    fn profile_label_extraction_defaults_to_unknown() {
        let mut labels = BTreeMap::new();
        assert_eq!(profile_from_labels(&labels, "profile"), "unknown");
        labels.insert("profile".into(), String::new());
        assert_eq!(profile_from_labels(&labels, "profile"), "unknown");
        labels.insert("profile".into(), "default".into());
        assert_eq!(profile_from_labels(&labels, "profile"), "default");
    }
}
