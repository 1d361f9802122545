//! autovpa library crate.
//!
//! Watches Deployments, StatefulSets and DaemonSets for the profile
//! annotation and keeps exactly one managed VerticalPodAutoscaler per
//! opted-in workload, derived from a library of named profiles. A separate
//! safety-net controller deletes managed VPAs whose ownership has been
//! corrupted.

pub mod config;
pub mod controller;
pub mod health;
pub mod metrics;
pub mod options;
pub mod predicates;
pub mod template;
pub mod vpa;
pub mod workload;

pub use controller::context::{Context, MetaConfig};
pub use health::HealthState;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::DynamicObject;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, reflector, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::error::Error;
use controller::{vpa_guard, workload as workload_controller};
use predicates::{ManagedVpaContent, ManagedVpaStructural, ProfileAnnotationLifecycle};
use workload::Workload;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Namespaced or cluster-wide dynamic API for VPAs.
fn scoped_vpa_api(client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = vpa::vpa_api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

/// Watcher configuration shared by all controllers.
///
/// `any_semantic()` makes resource discovery reliable in test environments.
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Watcher configuration for VPA streams: server-side filtered to managed
/// VPAs. Removing the managed label surfaces as a delete on this watch,
/// which the lifecycle filters treat like any other managed-VPA deletion.
fn managed_vpa_watcher_config(managed_label: &str) -> WatcherConfig {
    default_watcher_config().labels(&format!("{managed_label}=true"))
}

/// Log one controller result the way all four controllers report them.
fn log_controller_error(
    controller_name: &str,
    e: &kube::runtime::controller::Error<Error, watcher::Error>,
) {
    // ObjectNotFound errors are expected after deletion when related watch
    // events trigger reconciliation for a deleted object.
    let is_not_found = match e {
        kube::runtime::controller::Error::ObjectNotFound(_) => true,
        kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
        _ => false,
    };
    if is_not_found {
        debug!(controller = %controller_name, "Object no longer exists (likely deleted): {e:?}");
    } else {
        error!(controller = %controller_name, "Reconciliation error: {e:?}");
    }
}

/// Run one workload controller.
///
/// The primary stream is the workload watch filtered through the
/// profile-annotation lifecycle predicate; owned managed-VPA events requeue
/// the owner through the content filter so drift snaps back.
async fn run_workload_controller<K: Workload>(ctx: Arc<Context>, namespace: Option<&str>) {
    let controller_name = K::KIND.controller_name();
    info!(
        controller = %controller_name,
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting workload controller"
    );

    let workloads: Api<K> = scoped_api(ctx.client.clone(), namespace);
    let vpas = scoped_vpa_api(ctx.client.clone(), namespace);

    let (reader, writer) = reflector::store::<K>();
    let workload_trigger = predicates::filter_events(
        reflector(writer, watcher(workloads, default_watcher_config())).default_backoff(),
        ProfileAnnotationLifecycle::new(ctx.meta.profile_key.clone()),
    );

    let vpa_trigger = predicates::filter_events(
        watcher(vpas, managed_vpa_watcher_config(&ctx.meta.managed_label)).default_backoff(),
        ManagedVpaContent::new(ctx.meta.managed_label.clone(), ctx.meta.profile_key.clone()),
    );

    Controller::for_stream(workload_trigger, reader)
        .owns_stream_with(vpa_trigger, vpa::vpa_api_resource())
        .run(
            workload_controller::reconcile::<K>,
            workload_controller::error_policy::<K>,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(controller = %controller_name, "Reconciled: {}", obj.name),
                Err(e) => log_controller_error(controller_name, &e),
            }
        })
        .await;

    // This should never complete in normal operation
    error!(controller = %controller_name, "Controller stream ended unexpectedly");
}

/// Run the VPA safety-net controller.
///
/// Watches managed VPAs only, filtered to structural transitions; content
/// edits never wake it.
async fn run_vpa_guard(ctx: Arc<Context>, namespace: Option<&str>) {
    info!(
        controller = "vpa",
        scope = namespace.unwrap_or("cluster-wide"),
        "Starting VPA safety-net controller"
    );

    let ar = vpa::vpa_api_resource();
    let vpas = scoped_vpa_api(ctx.client.clone(), namespace);

    let writer = Writer::new(ar.clone());
    let reader = writer.as_reader();
    let trigger = predicates::filter_events(
        reflector(
            writer,
            watcher(vpas, managed_vpa_watcher_config(&ctx.meta.managed_label)),
        )
        .default_backoff(),
        ManagedVpaStructural::new(ctx.meta.managed_label.clone()),
    );

    Controller::for_stream_with(trigger, reader, ar)
        .run(vpa_guard::reconcile, vpa_guard::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => debug!(controller = "vpa", "Reconciled: {}", obj.name),
                Err(e) => log_controller_error("vpa", &e),
            }
        })
        .await;

    error!(controller = "vpa", "Controller stream ended unexpectedly");
}

/// Run all controllers for one namespace scope.
async fn run_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    futures::join!(
        run_workload_controller::<Deployment>(ctx.clone(), namespace),
        run_workload_controller::<StatefulSet>(ctx.clone(), namespace),
        run_workload_controller::<DaemonSet>(ctx.clone(), namespace),
        run_vpa_guard(ctx.clone(), namespace),
    );
}

/// Run the operator's controllers.
///
/// With an empty namespace list everything runs cluster-wide; otherwise one
/// controller set runs per watched namespace.
pub async fn run_controllers(ctx: Arc<Context>, watch_namespaces: &[String]) {
    ctx.health.set_ready(true).await;

    if watch_namespaces.is_empty() {
        info!(mode = "cluster-wide", "namespace scope");
        run_scoped(ctx, None).await;
    } else {
        info!(mode = "namespaced", namespaces = ?watch_namespaces, "namespace scope");
        let runs = watch_namespaces
            .iter()
            .map(|ns| run_scoped(ctx.clone(), Some(ns.as_str())));
        futures::future::join_all(runs).await;
    }
}
