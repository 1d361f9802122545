//! Shared context for the controllers.
//!
//! One `Context` is shared by all reconcilers. It carries the Kubernetes
//! client, the event reporter identity, the immutable meta/profile
//! configuration and the metrics handle. Reconcilers own no other state;
//! the cluster itself is the only mutable thing they touch.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

use crate::config::ProfileConfig;
use crate::health::HealthState;
use crate::metrics::Metrics;
use crate::vpa::FIELD_MANAGER;
use crate::workload::WorkloadKind;

/// Annotation/label keys shared across reconcilers.
///
/// `profile_key` is the workload annotation selecting a profile;
/// `managed_label` marks VPAs as operator-owned. The two must be distinct,
/// which startup validation enforces.
#[derive(Clone, Debug)]
pub struct MetaConfig {
    /// Workload annotation key used to pick a VPA profile.
    pub profile_key: String,
    /// Label key applied to VPAs managed by this operator.
    pub managed_label: String,
    /// Propagate the Argo tracking annotation to managed VPAs.
    pub argo_managed: bool,
    /// Annotation key to propagate when `argo_managed` is enabled.
    pub argo_tracking_annotation: String,
}

/// Shared context for all reconcilers.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Event reporter identity
    reporter: Reporter,
    /// Annotation/label configuration
    pub meta: MetaConfig,
    /// Validated profile library
    pub profiles: ProfileConfig,
    /// Health and metrics state
    pub health: Arc<HealthState>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        meta: MetaConfig,
        profiles: ProfileConfig,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            meta,
            profiles,
            health,
        }
    }

    /// Metrics handle.
    pub fn metrics(&self) -> &Metrics {
        &self.health.metrics
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for the referenced object
    pub async fn publish_normal(
        &self,
        object_ref: &ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.publish(object_ref, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for the referenced object
    pub async fn publish_warning(
        &self,
        object_ref: &ObjectReference,
        reason: &str,
        action: &str,
        note: String,
    ) {
        self.publish(object_ref, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish(
        &self,
        object_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = self.recorder();
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}

/// Object reference for a workload that may no longer exist.
///
/// Cleanup paths emit events against workloads that were just deleted; a
/// reference built from the key is all the event needs.
pub fn workload_object_ref(kind: WorkloadKind, namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(kind.api_version().to_string()),
        kind: Some(kind.kind().to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}
