//! Workload reconciliation.
//!
//! One controller instance runs per workload kind; all of them delegate to
//! the shared [`reconcile`] routine, which drives the managed VPA for a
//! single workload toward the state derived from its selected profile.
//!
//! Every step is idempotent. Failures split two ways: transient API errors
//! bubble up so the controller requeues with backoff, while configuration
//! problems (missing profile, bad template) are reported through events and
//! counters and then swallowed. Requeuing cannot fix a profile name, and a
//! hot loop would only burn the API server.

use std::sync::Arc;

use kube::api::{Api, DynamicObject};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::context::{Context, workload_object_ref};
use crate::controller::desired::{self, DesiredVpa};
use crate::controller::error::Error;
use crate::vpa;
use crate::workload::{Workload, WorkloadFacts, WorkloadKind};

/// Why a workload's managed VPAs are being purged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PurgeReason {
    /// The profile annotation is gone or empty.
    OptOut,
    /// The workload itself is gone or terminating.
    WorkloadGone,
}

/// Reconcile a single workload.
///
/// Flow: re-fetch the workload, clean up if it is gone or terminating,
/// resolve the selected profile, build the desired VPA, prune obsolete
/// managed VPAs, then create or converge the one VPA with the desired name.
pub async fn reconcile<K: Workload>(obj: Arc<K>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = obj
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = obj.name_any();

    // Re-read through the API; the triggering object can lag the cluster,
    // and a stale view here risks resurrecting a deleted VPA.
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);
    let workload = match api.get(&name).await {
        Ok(w) => w,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(
                kind = %K::KIND,
                namespace = %namespace,
                workload = %name,
                "workload not found; cleaning managed VPAs if any"
            );
            purge_managed_vpas(&ctx, &namespace, K::KIND, &name, PurgeReason::WorkloadGone).await?;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let facts = WorkloadFacts::from_resource(&workload)?;

    // Deletion has started; clean up now rather than waiting for the final
    // delete event.
    if facts.terminating {
        info!(
            kind = %K::KIND,
            namespace = %namespace,
            workload = %name,
            "workload terminating; cleaning managed VPAs"
        );
        purge_managed_vpas(&ctx, &namespace, K::KIND, &name, PurgeReason::WorkloadGone).await?;
        return Ok(Action::await_change());
    }

    let workload_ref = workload.object_ref(&());

    // Opt-in check. Absent or empty annotation means everything managed for
    // this workload must go.
    let Some(annotation) = facts.profile_annotation(&ctx.meta.profile_key) else {
        info!(
            kind = %K::KIND,
            namespace = %namespace,
            workload = %name,
            annotation = %ctx.meta.profile_key,
            "profile annotation missing, skipping VPA"
        );
        ctx.publish_warning(
            &workload_ref,
            "ProfileAnnotationMissing",
            "Reconcile",
            format!("annotation {:?} missing; skipping VPA", ctx.meta.profile_key),
        )
        .await;
        ctx.metrics()
            .inc_vpa_skipped(&namespace, &name, K::KIND.kind(), "annotation_missing");

        purge_managed_vpas(&ctx, &namespace, K::KIND, &name, PurgeReason::OptOut).await?;
        return Ok(Action::await_change());
    };

    // The annotation value is taken literally; the empty-string fallback to
    // the default profile never fires because empty values opted out above.
    let selected = ctx.profiles.resolve(annotation).to_string();

    let Some(profile) = ctx.profiles.profiles.get(&selected) else {
        // Warn but do not requeue; retrying cannot help until the config or
        // the annotation changes. The existing VPA is deliberately left in
        // place while the user fixes the profile name.
        info!(
            kind = %K::KIND,
            namespace = %namespace,
            workload = %name,
            profile = %selected,
            "profile not found"
        );
        ctx.publish_warning(
            &workload_ref,
            "ProfileNotFound",
            "Reconcile",
            format!("profile {selected:?} not found"),
        )
        .await;
        ctx.metrics()
            .inc_vpa_skipped(&namespace, &name, K::KIND.kind(), "profile_missing");
        return Ok(Action::await_change());
    };

    let desired = match desired::build_desired(&facts, &selected, profile, &ctx.profiles, &ctx.meta)
    {
        Ok(d) => d,
        Err(e @ Error::Template(_)) => {
            // A template that renders for placeholder data can still fail on
            // real names (length, character set). Configuration error: report
            // and stand down.
            warn!(
                kind = %K::KIND,
                namespace = %namespace,
                workload = %name,
                profile = %selected,
                error = %e,
                "VPA name template failed; skipping VPA"
            );
            ctx.publish_warning(
                &workload_ref,
                "NameTemplateInvalid",
                "Reconcile",
                format!("VPA name template failed for profile {selected:?}: {e}"),
            )
            .await;
            ctx.metrics()
                .inc_reconcile_errors(K::KIND.controller_name(), K::KIND.kind(), "template");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let vpa_api = vpa::vpa_api(ctx.client.clone(), &namespace);

    // A profile or template change shifts the desired name; anything managed
    // that this workload owns under another name is obsolete.
    prune_obsolete(&ctx, &vpa_api, &facts, &desired.name).await?;

    let existing = match vpa_api.get(&desired.name).await {
        Ok(v) => Some(v),
        Err(kube::Error::Api(ae)) if ae.code == 404 => None,
        Err(e) => return Err(e.into()),
    };

    let Some(existing) = existing else {
        create_vpa(&ctx, &vpa_api, &facts, &desired, &workload_ref).await?;
        return Ok(Action::await_change());
    };

    // Tie-break: a VPA with the desired name controlled by a different
    // workload is never overwritten. Profile templates must produce distinct
    // names per workload; surface the collision and stand down.
    if let Some(owner) = vpa::controller_owner(&existing)
        && !(owner.kind == facts.kind.kind() && owner.name == facts.name && owner.uid == facts.uid)
    {
        warn!(
            kind = %K::KIND,
            namespace = %namespace,
            workload = %name,
            vpa = %desired.name,
            owner_kind = %owner.kind,
            owner_name = %owner.name,
            "desired VPA name is controlled by another workload; leaving it untouched"
        );
        ctx.publish_warning(
            &workload_ref,
            "VPANameCollision",
            "Reconcile",
            format!(
                "VPA {} already controlled by {} {}; not overwriting",
                desired.name, owner.kind, owner.name
            ),
        )
        .await;
        return Ok(Action::await_change());
    }

    // A ref-less VPA with the desired name is adopted: the apply below adds
    // the controller owner reference.
    let applied = desired::applied_object(&desired, &facts, Some(&existing));
    if !vpa::needs_update(&existing, &applied) {
        debug!(
            kind = %K::KIND,
            namespace = %namespace,
            workload = %name,
            vpa = %desired.name,
            "VPA up to date"
        );
        return Ok(Action::await_change());
    }

    vpa::apply(&vpa_api, &applied).await?;

    ctx.publish_normal(
        &workload_ref,
        "VPAUpdated",
        "Reconcile",
        format!("Updated VPA {} to profile {}", desired.name, desired.profile),
    )
    .await;
    ctx.metrics()
        .inc_vpa_updated(&namespace, &name, K::KIND.kind(), &desired.profile);
    info!(
        kind = %K::KIND,
        namespace = %namespace,
        workload = %name,
        vpa = %desired.name,
        profile = %desired.profile,
        "updated VPA"
    );

    Ok(Action::await_change())
}

/// Error policy for the workload controllers.
pub fn error_policy<K: Workload>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    ctx.metrics()
        .inc_reconcile_errors(K::KIND.controller_name(), K::KIND.kind(), error.reason());

    if error.is_not_found() {
        debug!(kind = %K::KIND, workload = %name, "object vanished mid-reconcile");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(kind = %K::KIND, workload = %name, error = %error, "retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        tracing::error!(kind = %K::KIND, workload = %name, error = %error, "non-retryable error");
        Action::requeue(std::time::Duration::from_secs(300))
    }
}

/// Create the managed VPA for a workload from scratch.
async fn create_vpa(
    ctx: &Context,
    api: &Api<DynamicObject>,
    facts: &WorkloadFacts,
    desired: &DesiredVpa,
    workload_ref: &k8s_openapi::api::core::v1::ObjectReference,
) -> Result<(), Error> {
    let applied = desired::applied_object(desired, facts, None);
    vpa::apply(api, &applied).await?;

    ctx.publish_normal(
        workload_ref,
        "VPACreated",
        "Reconcile",
        format!("Created VPA {} with profile {}", desired.name, desired.profile),
    )
    .await;
    ctx.metrics().inc_vpa_created(
        &facts.namespace,
        &facts.name,
        facts.kind.kind(),
        &desired.profile,
    );
    ctx.metrics()
        .inc_managed_vpa(&facts.namespace, &desired.profile);
    info!(
        kind = %facts.kind,
        namespace = %facts.namespace,
        workload = %facts.name,
        vpa = %desired.name,
        profile = %desired.profile,
        "created VPA"
    );
    Ok(())
}

/// Delete managed VPAs owned by this workload whose name is not the desired
/// one. Runs while the workload is alive, so ownership is matched by uid.
async fn prune_obsolete(
    ctx: &Context,
    api: &Api<DynamicObject>,
    facts: &WorkloadFacts,
    keep_name: &str,
) -> Result<(), Error> {
    let items = vpa::list_managed(api, &ctx.meta.managed_label).await?;
    for item in items {
        let vpa_name = item.name_any();
        if vpa_name == keep_name || !vpa::is_controlled_by(&item, facts) {
            continue;
        }

        vpa::delete(api, &vpa_name).await?;

        let profile = vpa::profile_from_labels(item.labels(), &ctx.meta.profile_key);
        ctx.metrics()
            .inc_vpa_deleted_obsolete(&facts.namespace, facts.kind.kind());
        ctx.metrics().dec_managed_vpa(&facts.namespace, profile);
        ctx.publish_normal(
            &workload_object_ref(facts.kind, &facts.namespace, &facts.name),
            "DeletedObsoleteVPA",
            "Prune",
            format!("Deleted obsolete VPA {vpa_name}"),
        )
        .await;
        info!(
            kind = %facts.kind,
            namespace = %facts.namespace,
            workload = %facts.name,
            vpa = %vpa_name,
            "deleted obsolete VPA"
        );
    }
    Ok(())
}

/// Delete every managed VPA owned by the named workload.
///
/// Runs when the workload opted out, is terminating, or is already gone, so
/// ownership is matched by kind and name only; no uid is available for a
/// deleted workload. Relies on the managed label being intact: a user who
/// strips it after opting out keeps the VPA (the documented escape hatch).
async fn purge_managed_vpas(
    ctx: &Context,
    namespace: &str,
    kind: WorkloadKind,
    owner_name: &str,
    reason: PurgeReason,
) -> Result<(), Error> {
    let api = vpa::vpa_api(ctx.client.clone(), namespace);
    let items = vpa::list_managed(&api, &ctx.meta.managed_label).await?;

    for item in items {
        if !vpa::is_owned_by_name(&item, kind, owner_name) {
            continue;
        }
        let vpa_name = item.name_any();

        vpa::delete(&api, &vpa_name).await?;

        let profile = vpa::profile_from_labels(item.labels(), &ctx.meta.profile_key);
        match reason {
            PurgeReason::OptOut => ctx.metrics().inc_vpa_deleted_opt_out(namespace, kind.kind()),
            PurgeReason::WorkloadGone => ctx
                .metrics()
                .inc_vpa_deleted_workload_gone(namespace, kind.kind()),
        }
        ctx.metrics().dec_managed_vpa(namespace, profile);
        ctx.publish_normal(
            &workload_object_ref(kind, namespace, owner_name),
            "DeletedManagedVPA",
            "Cleanup",
            format!("Deleted managed VPA {vpa_name} for workload {owner_name}"),
        )
        .await;
        info!(
            kind = %kind,
            namespace = %namespace,
            workload = %owner_name,
            vpa = %vpa_name,
            "deleted managed VPA for opted-out or removed workload"
        );
    }
    Ok(())
}
