//! Command-line options.
//!
//! Every flag can also be set through an `AUTOVPA_`-prefixed environment
//! variable. The record is parsed once at startup and treated as immutable
//! afterwards; anything invalid here is fatal before any controller starts.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Default annotation key workloads set to request a profile.
pub const PROFILE_ANNOTATION: &str = "autovpa.containeroo.ch/profile";

/// Default label key marking VPAs as managed by the operator.
pub const MANAGED_LABEL: &str = "autovpa.containeroo.ch/managed";

/// Annotation propagated to managed VPAs when `--argo-managed` is set.
pub const ARGO_TRACKING_ANNOTATION: &str = "argocd.argoproj.io/tracking-id";

/// Default template used to render managed VPA names.
pub const DEFAULT_NAME_TEMPLATE: &str = "{{ WorkloadName }}-vpa";

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Console,
}

/// All configuration options for the operator.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "autovpa",
    version,
    about = "Manages VerticalPodAutoscalers for annotated workloads from named profiles",
    after_help = "Template variables: WorkloadName, Namespace, Kind, Profile. \
                  Template filters: lower, replace, trim, truncate, dns_label.\n\
                  Each flag can also be set via environment variable using the \
                  AUTOVPA_ prefix, e.g. --log-format=json -> AUTOVPA_LOG_FORMAT=json"
)]
pub struct Options {
    /// Path to the profiles file
    #[arg(short, long, env = "AUTOVPA_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Annotation key workloads must set to request a profile
    #[arg(
        long,
        env = "AUTOVPA_PROFILE_ANNOTATION",
        default_value = PROFILE_ANNOTATION,
        value_name = "ANNOTATION"
    )]
    pub profile_annotation: String,

    /// Label key to mark VPAs as managed by the operator
    #[arg(
        long,
        env = "AUTOVPA_MANAGED_LABEL",
        default_value = MANAGED_LABEL,
        value_name = "LABEL"
    )]
    pub managed_label: String,

    /// Template used to render managed VPA names; override per profile with nameTemplate
    #[arg(
        long,
        env = "AUTOVPA_VPA_NAME_TEMPLATE",
        default_value = DEFAULT_NAME_TEMPLATE,
        value_name = "TEMPLATE"
    )]
    pub vpa_name_template: String,

    /// Add the Argo CD tracking annotation to managed VPAs
    #[arg(long, env = "AUTOVPA_ARGO_MANAGED", default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub argo_managed: bool,

    /// Namespaces to watch (repeatable or comma-separated; empty = all)
    #[arg(
        long = "watch-namespace",
        env = "AUTOVPA_WATCH_NAMESPACE",
        value_name = "NAMESPACE",
        value_delimiter = ','
    )]
    pub watch_namespaces: Vec<String>,

    /// Enable or disable the metrics endpoint
    #[arg(long, env = "AUTOVPA_METRICS_ENABLED", default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub metrics_enabled: bool,

    /// Health and readiness probe address
    #[arg(
        long,
        env = "AUTOVPA_PROBE_ADDR",
        default_value = "0.0.0.0:8081",
        value_name = "ADDR:PORT"
    )]
    pub probe_addr: SocketAddr,

    /// Enable leader election
    #[arg(long = "leader-elect", env = "AUTOVPA_LEADER_ELECT", default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub leader_election: bool,

    /// Disable the startup check for the VPA CRD
    #[arg(long, env = "AUTOVPA_DISABLE_CRD_CHECK", default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub disable_crd_check: bool,

    /// Log format
    #[arg(long, env = "AUTOVPA_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Options {
    /// Reject colliding annotation/label keys.
    ///
    /// The managed label identifies operator-owned VPAs and the profile
    /// annotation carries user intent; sharing a key would make opt-out and
    /// snap-back ambiguous. Checked once, fatal on failure.
    pub fn validate_keys(&self) -> Result<(), String> {
        let keys = [
            ("profile-annotation", self.profile_annotation.as_str()),
            ("managed-label", self.managed_label.as_str()),
            ("argo-tracking-annotation", ARGO_TRACKING_ANNOTATION),
        ];
        for (i, (name_a, value_a)) in keys.iter().enumerate() {
            if value_a.is_empty() {
                return Err(format!("{name_a} must not be empty"));
            }
            for (name_b, value_b) in keys.iter().skip(i + 1) {
                if value_a == value_b {
                    return Err(format!(
                        "duplicate key {value_a:?} used for both {name_a} and {name_b}"
                    ));
                }
            }
        }
        Ok(())
    }
}
