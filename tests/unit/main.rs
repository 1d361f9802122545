//! Unit tests for autovpa.
//!
//! These run without a Kubernetes cluster and exercise the pure core of the
//! reconcilers through the public API: desired-state derivation, convergence
//! decisions, obsolete pruning and the safety net's ownership verdicts.
//!
//! Test code is allowed to use expect() for error handling
#![allow(clippy::expect_used, clippy::unwrap_used)]

#[path = "../common/mod.rs"]
mod common;

use autovpa::MetaConfig;
use autovpa::config::{self, ProfileConfig};
use autovpa::options::ARGO_TRACKING_ANNOTATION;
use autovpa::workload::WorkloadFacts;
use common::fixtures::{DeploymentBuilder, MANAGED_LABEL, PROFILE_KEY, VpaBuilder};

fn meta_config() -> MetaConfig {
    MetaConfig {
        profile_key: PROFILE_KEY.into(),
        managed_label: MANAGED_LABEL.into(),
        argo_managed: false,
        argo_tracking_annotation: ARGO_TRACKING_ANNOTATION.into(),
    }
}

/// A small profile library: a default profile and a second one carrying its
/// own name template.
fn profile_library() -> ProfileConfig {
    config::parse(
        r#"
defaultProfile: default
profiles:
  default:
    updatePolicy:
      updateMode: "Off"
  auto:
    nameTemplate: "{{ WorkloadName }}-vpa"
    updatePolicy:
      updateMode: "Auto"
"#,
    )
    .expect("parse profiles")
    .validate("{{ WorkloadName }}-{{ Profile }}-vpa")
    .expect("validate profiles")
}

mod desired_state_tests {
    use super::*;
    use autovpa::controller::desired::{applied_object, build_desired};
    use serde_json::json;

    #[test]
    fn deployment_with_default_profile_yields_expected_vpa() {
        let profiles = profile_library();
        let dep = DeploymentBuilder::new("demo")
            .namespace("ns1")
            .profile("default")
            .build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");

        let desired = build_desired(
            &facts,
            "default",
            &profiles.profiles["default"],
            &profiles,
            &meta_config(),
        )
        .expect("build desired");

        assert_eq!(desired.name, "demo-default-vpa");
        assert_eq!(desired.labels[MANAGED_LABEL], "true");
        assert_eq!(desired.labels[PROFILE_KEY], "default");
        assert_eq!(
            desired.spec,
            json!({
                "targetRef": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": "demo",
                },
                "updatePolicy": {"updateMode": "Off"},
            })
        );

        let applied = applied_object(&desired, &facts, None);
        let owners = applied.metadata.owner_references.expect("owner refs");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].name, "demo");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn switching_profiles_changes_the_rendered_name() {
        let profiles = profile_library();
        let dep = DeploymentBuilder::new("demo")
            .namespace("ns1")
            .profile("auto")
            .build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");

        let before = build_desired(
            &facts,
            "default",
            &profiles.profiles["default"],
            &profiles,
            &meta_config(),
        )
        .expect("desired for default");
        let after = build_desired(
            &facts,
            "auto",
            &profiles.profiles["auto"],
            &profiles,
            &meta_config(),
        )
        .expect("desired for auto");

        assert_eq!(before.name, "demo-default-vpa");
        assert_eq!(after.name, "demo-vpa");
        assert_eq!(after.spec["updatePolicy"]["updateMode"], "Auto");
    }

    #[test]
    fn unknown_profile_is_absent_from_the_library() {
        // The reconciler skips (and keeps any existing VPA) in this case;
        // here we pin the lookup it relies on.
        let profiles = profile_library();
        assert!(!profiles.profiles.contains_key("ghost"));
    }
}

mod convergence_tests {
    use super::*;
    use autovpa::controller::desired::{applied_object, build_desired};
    use autovpa::vpa;

    /// A converged VPA produces zero writes on the next reconcile.
    #[test]
    fn second_reconcile_is_a_no_op() {
        let profiles = profile_library();
        let dep = DeploymentBuilder::new("demo")
            .namespace("ns1")
            .profile("default")
            .build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");
        let desired = build_desired(
            &facts,
            "default",
            &profiles.profiles["default"],
            &profiles,
            &meta_config(),
        )
        .expect("desired");

        // First reconcile applies this object; the API server echoes it back.
        let live = applied_object(&desired, &facts, None);

        // Second reconcile builds against the live object and compares.
        let replay = applied_object(&desired, &facts, Some(&live));
        assert!(!vpa::needs_update(&live, &replay));
    }

    /// Stripped operator labels are restored by the next applied object.
    #[test]
    fn tampered_labels_snap_back() {
        let profiles = profile_library();
        let dep = DeploymentBuilder::new("demo")
            .namespace("ns1")
            .profile("default")
            .build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");
        let desired = build_desired(
            &facts,
            "default",
            &profiles.profiles["default"],
            &profiles,
            &meta_config(),
        )
        .expect("desired");

        // User removed the managed label and added their own.
        let tampered = VpaBuilder::new("demo-default-vpa")
            .namespace("ns1")
            .label("team", "payments")
            .controlled_by("Deployment", "demo", "uid-1")
            .spec(desired.spec.clone())
            .build();

        let applied = applied_object(&desired, &facts, Some(&tampered));
        assert!(vpa::needs_update(&tampered, &applied));

        let labels = applied.metadata.labels.as_ref().expect("labels");
        assert_eq!(labels[MANAGED_LABEL], "true");
        assert_eq!(labels[PROFILE_KEY], "default");
        // Foreign labels survive the snap-back.
        assert_eq!(labels["team"], "payments");
    }

    /// Spec drift is detected and corrected by the applied object.
    #[test]
    fn spec_drift_triggers_an_update() {
        let profiles = profile_library();
        let dep = DeploymentBuilder::new("demo")
            .namespace("ns1")
            .profile("default")
            .build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");
        let desired = build_desired(
            &facts,
            "default",
            &profiles.profiles["default"],
            &profiles,
            &meta_config(),
        )
        .expect("desired");

        let drifted = VpaBuilder::new("demo-default-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "demo", "uid-1")
            .spec(serde_json::json!({"updatePolicy": {"updateMode": "Auto"}}))
            .build();

        let applied = applied_object(&desired, &facts, Some(&drifted));
        assert!(vpa::needs_update(&drifted, &applied));
        assert_eq!(applied.data["spec"]["updatePolicy"]["updateMode"], "Off");
    }

    /// A VPA with the desired name but another controller is a collision the
    /// reconciler must leave untouched.
    #[test]
    fn foreign_controller_is_not_adopted() {
        let dep = DeploymentBuilder::new("demo").namespace("ns1").profile("default").build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");

        let foreign = VpaBuilder::new("demo-default-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "other", "uid-9")
            .build();

        assert!(!autovpa::vpa::is_controlled_by(&foreign, &facts));
    }
}

mod pruning_tests {
    use super::*;
    use autovpa::vpa;
    use autovpa::workload::WorkloadKind;
    use kube::ResourceExt;

    /// After a profile switch the old VPA is owned by the workload but no
    /// longer carries the desired name: it must be selected for deletion.
    #[test]
    fn renamed_vpa_becomes_obsolete() {
        let dep = DeploymentBuilder::new("demo").namespace("ns1").profile("auto").build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");
        let keep_name = "demo-vpa";

        let obsolete = VpaBuilder::new("demo-default-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "demo", "uid-1")
            .build();
        let current = VpaBuilder::new("demo-vpa")
            .namespace("ns1")
            .managed("auto")
            .controlled_by("Deployment", "demo", "uid-1")
            .build();
        let foreign = VpaBuilder::new("other-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "other", "uid-9")
            .build();

        let candidates = [&obsolete, &current, &foreign];
        let doomed: Vec<_> = candidates
            .into_iter()
            .filter(|v| v.name_any() != keep_name && vpa::is_controlled_by(v, &facts))
            .collect();

        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].name_any(), "demo-default-vpa");
    }

    /// Opt-out cleanup matches by kind and name only; a recreated workload
    /// has a new uid but its stale VPAs must still be purged.
    #[test]
    fn purge_matches_by_kind_and_name() {
        let stale = VpaBuilder::new("demo-default-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "demo", "old-uid")
            .build();

        assert!(vpa::is_owned_by_name(&stale, WorkloadKind::Deployment, "demo"));
        assert!(!vpa::is_owned_by_name(&stale, WorkloadKind::DaemonSet, "demo"));
        assert!(!vpa::is_owned_by_name(&stale, WorkloadKind::Deployment, "other"));
    }

    /// Terminating workloads are cleaned up before the final delete event.
    #[test]
    fn terminating_workload_is_detected() {
        let dep = DeploymentBuilder::new("demo").profile("default").terminating().build();
        let facts = WorkloadFacts::from_resource(&dep).expect("facts");
        assert!(facts.terminating);
    }
}

mod safety_net_tests {
    use super::*;
    use autovpa::controller::vpa_guard::{OwnerVerdict, classify_owner};
    use autovpa::vpa;
    use autovpa::workload::WorkloadKind;

    #[test]
    fn vpa_pointing_at_missing_deployment_resolves_to_its_owner() {
        let orphan_candidate = VpaBuilder::new("lost-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("Deployment", "missing-dep", "uid-1")
            .build();

        // The guard still has to ask the API server whether the owner
        // exists; the structural verdict is what we can pin here.
        assert_eq!(
            classify_owner(&orphan_candidate),
            OwnerVerdict::Owner(WorkloadKind::Deployment, "missing-dep".into())
        );
    }

    #[test]
    fn ref_less_managed_vpa_is_an_orphan() {
        let orphan = VpaBuilder::new("lost-vpa").namespace("ns1").managed("default").build();
        assert_eq!(classify_owner(&orphan), OwnerVerdict::Orphan);
    }

    #[test]
    fn unsupported_owner_kind_is_an_orphan() {
        let odd = VpaBuilder::new("lost-vpa")
            .namespace("ns1")
            .managed("default")
            .controlled_by("ReplicaSet", "demo-abc123", "uid-1")
            .build();
        assert_eq!(classify_owner(&odd), OwnerVerdict::Orphan);
    }

    #[test]
    fn unmanaged_vpas_are_invisible_to_the_operator() {
        let user_owned = VpaBuilder::new("user-vpa").namespace("ns1").build();
        assert!(!vpa::is_managed(&user_owned, MANAGED_LABEL));

        let profile = vpa::profile_from_labels(
            kube::ResourceExt::labels(&user_owned),
            PROFILE_KEY,
        );
        assert_eq!(profile, "unknown");
    }
}
