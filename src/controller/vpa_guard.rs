//! VPA safety net.
//!
//! Enforces the structural correctness of managed VPAs, nothing more. It
//! never creates or updates; it deletes managed VPAs that have no controller
//! owner, an unsupported owner kind, or an owner that no longer exists. All
//! desired-state work (create/update/snap-back) belongs to the workload
//! reconcilers: they author, this controller is the janitor, and the two
//! coordinate only through cluster state.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::{Api, DynamicObject};
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::Error;
use crate::vpa::{self, VPA_KIND};
use crate::workload::WorkloadKind;

/// Structural verdict on a managed VPA's controller owner reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerVerdict {
    /// No controller owner, or the owner kind is not a supported workload.
    Orphan,
    /// A supported controller owner; existence still needs checking.
    Owner(WorkloadKind, String),
}

/// Classify a VPA's controller owner reference.
pub fn classify_owner(vpa: &DynamicObject) -> OwnerVerdict {
    match vpa::controller_owner(vpa) {
        None => OwnerVerdict::Orphan,
        Some(owner) => match WorkloadKind::from_kind(&owner.kind) {
            None => OwnerVerdict::Orphan,
            Some(kind) => OwnerVerdict::Owner(kind, owner.name.clone()),
        },
    }
}

/// Reconcile a single VPA: validate ownership, delete invalid managed VPAs.
///
/// NotFound conditions are terminal and non-fatal everywhere; only failed
/// API operations return errors.
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = obj.name_any();

    // Load the VPA fresh; if it no longer exists, nothing to do.
    let api = vpa::vpa_api(ctx.client.clone(), &namespace);
    let live = match api.get(&name).await {
        Ok(v) => v,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(namespace = %namespace, vpa = %name, "managed VPA already deleted");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    // Unmanaged (user-owned) VPAs are ignored entirely.
    if !vpa::is_managed(&live, &ctx.meta.managed_label) {
        debug!(namespace = %namespace, vpa = %name, "managed label absent; skipping VPA");
        return Ok(Action::await_change());
    }

    match classify_owner(&live) {
        OwnerVerdict::Orphan => {
            info!(namespace = %namespace, vpa = %name, "orphaned managed VPA has no controller owner");
            ctx.publish_normal(
                &live.object_ref(&vpa::vpa_api_resource()),
                "OrphanedVPA",
                "Cleanup",
                format!("{namespace}/{name} has no controller owner"),
            )
            .await;

            vpa::delete(&api, &name).await?;

            let profile = vpa::profile_from_labels(live.labels(), &ctx.meta.profile_key);
            ctx.metrics().inc_vpa_deleted_orphaned(&namespace);
            ctx.metrics().dec_managed_vpa(&namespace, profile);
        }
        OwnerVerdict::Owner(kind, owner_name) => {
            if owner_exists(&ctx, kind, &namespace, &owner_name).await? {
                debug!(
                    namespace = %namespace,
                    vpa = %name,
                    owner_kind = %kind,
                    owner_name = %owner_name,
                    "managed VPA has valid controller owner"
                );
                return Ok(Action::await_change());
            }

            info!(
                namespace = %namespace,
                vpa = %name,
                owner_kind = %kind,
                owner_name = %owner_name,
                "owner gone; deleting VPA"
            );
            ctx.publish_normal(
                &live.object_ref(&vpa::vpa_api_resource()),
                "OwnerDeleted",
                "Cleanup",
                format!("owner {kind} {namespace}/{owner_name} gone; deleting VPA {name}"),
            )
            .await;

            vpa::delete(&api, &name).await?;

            let profile = vpa::profile_from_labels(live.labels(), &ctx.meta.profile_key);
            ctx.metrics()
                .inc_vpa_deleted_owner_gone(&namespace, kind.kind());
            ctx.metrics().dec_managed_vpa(&namespace, profile);
        }
    }

    Ok(Action::await_change())
}

/// Error policy for the safety-net controller.
pub fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    ctx.metrics()
        .inc_reconcile_errors("vpa", VPA_KIND, error.reason());

    if error.is_not_found() {
        debug!(vpa = %name, "VPA vanished mid-reconcile");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(vpa = %name, error = %error, "retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        tracing::error!(vpa = %name, error = %error, "non-retryable error");
        Action::requeue(std::time::Duration::from_secs(300))
    }
}

/// Whether the referenced owner workload still exists.
///
/// Metadata-only fetch through the kind-specific API; the safety net never
/// needs the owner's content.
async fn owner_exists(
    ctx: &Context,
    kind: WorkloadKind,
    namespace: &str,
    name: &str,
) -> Result<bool, Error> {
    let client = ctx.client.clone();
    let result = match kind {
        WorkloadKind::Deployment => Api::<Deployment>::namespaced(client, namespace)
            .get_metadata(name)
            .await
            .map(|_| ()),
        WorkloadKind::StatefulSet => Api::<StatefulSet>::namespaced(client, namespace)
            .get_metadata(name)
            .await
            .map(|_| ()),
        WorkloadKind::DaemonSet => Api::<DaemonSet>::namespaced(client, namespace)
            .get_metadata(name)
            .await
            .map(|_| ()),
    };

    match result {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn vpa_with_owners(owners: Option<Vec<OwnerReference>>) -> DynamicObject {
        let mut obj = vpa::new_vpa("demo-vpa", "ns1");
        obj.metadata.owner_references = owners;
        obj
    }

    fn owner_ref(kind: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".into(),
            kind: kind.into(),
            name: "demo".into(),
            uid: "uid-1".into(),
            controller: Some(controller),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn no_owner_refs_is_orphan() {
        assert_eq!(classify_owner(&vpa_with_owners(None)), OwnerVerdict::Orphan);
        assert_eq!(
            classify_owner(&vpa_with_owners(Some(vec![]))),
            OwnerVerdict::Orphan
        );
    }

    #[test]
    fn non_controller_ref_is_orphan() {
        let obj = vpa_with_owners(Some(vec![owner_ref("Deployment", false)]));
        assert_eq!(classify_owner(&obj), OwnerVerdict::Orphan);
    }

    #[test]
    fn unsupported_owner_kind_is_orphan() {
        let obj = vpa_with_owners(Some(vec![owner_ref("CronJob", true)]));
        assert_eq!(classify_owner(&obj), OwnerVerdict::Orphan);
    }

    #[test]
    fn supported_controller_owner_is_resolved() {
        for kind in WorkloadKind::ALL {
            let obj = vpa_with_owners(Some(vec![owner_ref(kind.kind(), true)]));
            assert_eq!(
                classify_owner(&obj),
                OwnerVerdict::Owner(kind, "demo".into())
            );
        }
    }

    #[test]
    fn controller_ref_wins_over_non_controller_refs() {
        let obj = vpa_with_owners(Some(vec![
            owner_ref("CronJob", false),
            owner_ref("StatefulSet", true),
        ]));
        assert_eq!(
            classify_owner(&obj),
            OwnerVerdict::Owner(WorkloadKind::StatefulSet, "demo".into())
        );
    }
}
