//! Desired-state builder.
//!
//! Pure functions from (workload facts, profile, configuration) to the VPA
//! the operator wants in the cluster. Nothing here reads process state or
//! talks to the API server, which is what makes the reconcile algorithm
//! testable without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Value, json};

use crate::config::{Profile, ProfileConfig};
use crate::controller::context::MetaConfig;
use crate::controller::error::Error;
use crate::template::{self, NameTemplateData};
use crate::vpa;
use crate::workload::WorkloadFacts;

/// The desired fields of a managed VPA.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredVpa {
    /// Rendered VPA name.
    pub name: String,
    /// Selected profile name.
    pub profile: String,
    /// Operator-authored labels: managed marker plus profile label.
    pub labels: BTreeMap<String, String>,
    /// Operator-authored annotations (Argo tracking, when enabled).
    pub annotations: BTreeMap<String, String>,
    /// Full VPA spec: profile fragment plus the derived `targetRef`.
    pub spec: Value,
}

/// Resolve the desired VPA for a workload and its selected profile.
///
/// The name comes from the profile's template (or the global default); the
/// spec is the profile fragment with `targetRef` pointing at the workload.
/// The workload uid deliberately stays out of `targetRef`; ownership is
/// expressed through the controller owner reference instead.
pub fn build_desired(
    facts: &WorkloadFacts,
    profile_name: &str,
    profile: &Profile,
    profiles: &ProfileConfig,
    meta: &MetaConfig,
) -> Result<DesiredVpa, Error> {
    let name = template::render_name(
        profiles.effective_template(profile),
        &NameTemplateData {
            workload_name: facts.name.clone(),
            namespace: facts.namespace.clone(),
            kind: facts.kind.kind().to_string(),
            profile: profile_name.to_string(),
        },
    )?;

    let mut spec = match profile.spec.clone() {
        Value::Object(map) => map,
        // Profiles are validated to be objects at load time.
        _ => serde_json::Map::new(),
    };
    spec.insert(
        "targetRef".to_string(),
        json!({
            "apiVersion": facts.kind.api_version(),
            "kind": facts.kind.kind(),
            "name": facts.name,
        }),
    );

    let labels = BTreeMap::from([
        (meta.managed_label.clone(), "true".to_string()),
        (meta.profile_key.clone(), profile_name.to_string()),
    ]);

    let mut annotations = BTreeMap::new();
    if meta.argo_managed
        && let Some(tracking) = facts.annotations.get(&meta.argo_tracking_annotation)
    {
        annotations.insert(meta.argo_tracking_annotation.clone(), tracking.clone());
    }

    Ok(DesiredVpa {
        name,
        profile: profile_name.to_string(),
        labels,
        annotations,
        spec: Value::Object(spec),
    })
}

/// Controller owner reference pointing at the workload.
///
/// This ties the VPA to the workload for garbage collection and marks the
/// operator's workload reconciler as the authoritative writer.
pub fn owner_reference(facts: &WorkloadFacts) -> OwnerReference {
    OwnerReference {
        api_version: facts.kind.api_version().to_string(),
        kind: facts.kind.kind().to_string(),
        name: facts.name.clone(),
        uid: facts.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Build the object handed to server-side apply.
///
/// Carries only fields the operator owns: name, namespace, labels, the
/// desired spec and the controller owner reference. On update the labels are
/// the union of the live object's labels and the desired ones (desired
/// winning), so foreign labels survive while operator labels snap back.
/// Status, annotations and managedFields of the live object never propagate.
pub fn applied_object(
    desired: &DesiredVpa,
    facts: &WorkloadFacts,
    existing: Option<&DynamicObject>,
) -> DynamicObject {
    let mut labels = existing.map(|e| e.labels().clone()).unwrap_or_default();
    labels.extend(desired.labels.clone());

    let mut obj = vpa::new_vpa(&desired.name, &facts.namespace);
    obj.metadata.labels = Some(labels);
    if !desired.annotations.is_empty() {
        obj.metadata.annotations = Some(desired.annotations.clone());
    }
    obj.metadata.owner_references = Some(vec![owner_reference(facts)]);
    obj.data = json!({ "spec": desired.spec });
    obj
}
