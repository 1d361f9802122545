//! Prometheus metrics for the operator.
//!
//! A typed façade over a prometheus-client registry. Counter families cover
//! every create/update/skip/delete path of the reconcilers; the
//! `managed_vpa` gauge tracks the live population per namespace and profile.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for created/updated counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct WorkloadProfileLabels {
    pub namespace: String,
    pub name: String,
    pub kind: &'static str,
    pub profile: String,
}

impl EncodeLabelSet for WorkloadProfileLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("kind", self.kind).encode(encoder.encode_label())?;
        ("profile", self.profile.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for skipped reconciliations; `reason` says why.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct SkipLabels {
    pub namespace: String,
    pub name: String,
    pub kind: &'static str,
    pub reason: &'static str,
}

impl EncodeLabelSet for SkipLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        ("kind", self.kind).encode(encoder.encode_label())?;
        ("reason", self.reason).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for deletion counters keyed by owner kind.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NamespaceKindLabels {
    pub namespace: String,
    pub kind: &'static str,
}

impl EncodeLabelSet for NamespaceKindLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("kind", self.kind).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Namespace-only labels (orphan deletions).
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct NamespaceLabels {
    pub namespace: String,
}

impl EncodeLabelSet for NamespaceLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for the managed-VPA population gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ManagedLabels {
    pub namespace: String,
    pub profile: String,
}

impl EncodeLabelSet for ManagedLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("profile", self.profile.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for reconcile errors.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub controller: &'static str,
    pub kind: &'static str,
    pub reason: &'static str,
}

impl EncodeLabelSet for ErrorLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("controller", self.controller).encode(encoder.encode_label())?;
        ("kind", self.kind).encode(encoder.encode_label())?;
        ("reason", self.reason).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// All operator metrics plus their registry.
pub struct Metrics {
    vpa_created: Family<WorkloadProfileLabels, Counter>,
    vpa_updated: Family<WorkloadProfileLabels, Counter>,
    vpa_skipped: Family<SkipLabels, Counter>,
    vpa_deleted_obsolete: Family<NamespaceKindLabels, Counter>,
    vpa_deleted_opt_out: Family<NamespaceKindLabels, Counter>,
    vpa_deleted_workload_gone: Family<NamespaceKindLabels, Counter>,
    vpa_deleted_owner_gone: Family<NamespaceKindLabels, Counter>,
    vpa_deleted_orphaned: Family<NamespaceLabels, Counter>,
    managed_vpa: Family<ManagedLabels, Gauge>,
    reconcile_errors: Family<ErrorLabels, Counter>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let vpa_created = Family::<WorkloadProfileLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_created",
            "Total number of VPAs created by the operator",
            vpa_created.clone(),
        );

        let vpa_updated = Family::<WorkloadProfileLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_updated",
            "Total number of VPAs updated by the operator",
            vpa_updated.clone(),
        );

        let vpa_skipped = Family::<SkipLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_skipped",
            "Total number of workload reconciliations skipped (reason label indicates why)",
            vpa_skipped.clone(),
        );

        let vpa_deleted_obsolete = Family::<NamespaceKindLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_deleted_obsolete",
            "Total number of managed VPAs deleted because their name became obsolete",
            vpa_deleted_obsolete.clone(),
        );

        let vpa_deleted_opt_out = Family::<NamespaceKindLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_deleted_opt_out",
            "Total number of managed VPAs deleted because the workload opted out",
            vpa_deleted_opt_out.clone(),
        );

        let vpa_deleted_workload_gone = Family::<NamespaceKindLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_deleted_workload_gone",
            "Total number of managed VPAs deleted because the workload no longer exists",
            vpa_deleted_workload_gone.clone(),
        );

        let vpa_deleted_owner_gone = Family::<NamespaceKindLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_deleted_owner_gone",
            "Total number of managed VPAs deleted because the referenced owner is missing",
            vpa_deleted_owner_gone.clone(),
        );

        let vpa_deleted_orphaned = Family::<NamespaceLabels, Counter>::default();
        registry.register(
            "autovpa_vpa_deleted_orphaned",
            "Total number of managed VPAs deleted because they lacked a controller owner reference",
            vpa_deleted_orphaned.clone(),
        );

        let managed_vpa = Family::<ManagedLabels, Gauge>::default();
        registry.register(
            "autovpa_managed_vpa",
            "Current number of managed VPAs by namespace and profile",
            managed_vpa.clone(),
        );

        let reconcile_errors = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "autovpa_reconcile_errors",
            "Total number of reconciliation errors by controller, kind and reason",
            reconcile_errors.clone(),
        );

        Self {
            vpa_created,
            vpa_updated,
            vpa_skipped,
            vpa_deleted_obsolete,
            vpa_deleted_opt_out,
            vpa_deleted_workload_gone,
            vpa_deleted_owner_gone,
            vpa_deleted_orphaned,
            managed_vpa,
            reconcile_errors,
            registry,
        }
    }

    pub fn inc_vpa_created(&self, namespace: &str, name: &str, kind: &'static str, profile: &str) {
        self.vpa_created
            .get_or_create(&WorkloadProfileLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                kind,
                profile: profile.to_string(),
            })
            .inc();
    }

    pub fn inc_vpa_updated(&self, namespace: &str, name: &str, kind: &'static str, profile: &str) {
        self.vpa_updated
            .get_or_create(&WorkloadProfileLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                kind,
                profile: profile.to_string(),
            })
            .inc();
    }

    pub fn inc_vpa_skipped(
        &self,
        namespace: &str,
        name: &str,
        kind: &'static str,
        reason: &'static str,
    ) {
        self.vpa_skipped
            .get_or_create(&SkipLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                kind,
                reason,
            })
            .inc();
    }

    pub fn inc_vpa_deleted_obsolete(&self, namespace: &str, kind: &'static str) {
        self.vpa_deleted_obsolete
            .get_or_create(&NamespaceKindLabels {
                namespace: namespace.to_string(),
                kind,
            })
            .inc();
    }

    pub fn inc_vpa_deleted_opt_out(&self, namespace: &str, kind: &'static str) {
        self.vpa_deleted_opt_out
            .get_or_create(&NamespaceKindLabels {
                namespace: namespace.to_string(),
                kind,
            })
            .inc();
    }

    pub fn inc_vpa_deleted_workload_gone(&self, namespace: &str, kind: &'static str) {
        self.vpa_deleted_workload_gone
            .get_or_create(&NamespaceKindLabels {
                namespace: namespace.to_string(),
                kind,
            })
            .inc();
    }

    pub fn inc_vpa_deleted_owner_gone(&self, namespace: &str, kind: &'static str) {
        self.vpa_deleted_owner_gone
            .get_or_create(&NamespaceKindLabels {
                namespace: namespace.to_string(),
                kind,
            })
            .inc();
    }

    pub fn inc_vpa_deleted_orphaned(&self, namespace: &str) {
        self.vpa_deleted_orphaned
            .get_or_create(&NamespaceLabels {
                namespace: namespace.to_string(),
            })
            .inc();
    }

    pub fn inc_managed_vpa(&self, namespace: &str, profile: &str) {
        self.managed_vpa
            .get_or_create(&ManagedLabels {
                namespace: namespace.to_string(),
                profile: profile.to_string(),
            })
            .inc();
    }

    pub fn dec_managed_vpa(&self, namespace: &str, profile: &str) {
        self.managed_vpa
            .get_or_create(&ManagedLabels {
                namespace: namespace.to_string(),
                profile: profile.to_string(),
            })
            .dec();
    }

    pub fn inc_reconcile_errors(
        &self,
        controller: &'static str,
        kind: &'static str,
        reason: &'static str,
    ) {
        self.reconcile_errors
            .get_or_create(&ErrorLabels {
                controller,
                kind,
                reason,
            })
            .inc();
    }

    /// Encode all metrics to the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}
