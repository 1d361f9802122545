//! Profile library loading and validation.
//!
//! The profile file is a YAML document naming a default profile and a map of
//! profiles. Each profile carries an optional `nameTemplate` override; every
//! other key belongs to the inline VPA spec fragment, kept as loose JSON so
//! the operator stays decoupled from the VPA schema. `targetRef` is always
//! derived from the workload at reconcile time and is therefore rejected
//! here.
//!
//! Validation happens once at startup; the resulting [`ProfileConfig`] is
//! immutable for the life of the process.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::template::{self, NameTemplateData, TemplateError};

/// A single validated profile.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    /// Per-profile VPA name template; `None` falls back to the global default.
    pub name_template: Option<String>,
    /// Inline VPA spec fragment, without `targetRef`.
    pub spec: Value,
}

/// The validated profile library plus naming defaults.
///
/// Immutable after startup; reconcilers read it lock-free.
#[derive(Clone, Debug)]
pub struct ProfileConfig {
    /// Global VPA name template, used when a profile has no override.
    pub name_template: String,
    /// Profile selected when a workload requests the empty string.
    pub default_profile: String,
    /// All profiles keyed by name.
    pub profiles: BTreeMap<String, Profile>,
}

impl ProfileConfig {
    /// Effective name template for a profile: override or global default.
    pub fn effective_template<'a>(&'a self, profile: &'a Profile) -> &'a str {
        profile.name_template.as_deref().unwrap_or(&self.name_template)
    }

    /// Resolve an annotation value to a profile name.
    ///
    /// Empty values fall back to the default profile. Callers treat empty
    /// annotations as opt-out before reaching this point, so the fallback is
    /// currently unreachable; it is kept for forward compatibility.
    pub fn resolve<'a>(&'a self, annotation_value: &'a str) -> &'a str {
        if annotation_value.is_empty() {
            &self.default_profile
        } else {
            annotation_value
        }
    }
}

/// Errors produced while loading or validating the profile file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read profiles file {path:?}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse profiles: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("profiles must be set")]
    NoProfiles,

    #[error("defaultProfile must be set")]
    NoDefaultProfile,

    #[error("defaultProfile {0:?} not found in profiles")]
    DefaultProfileMissing(String),

    #[error("profile {name:?} invalid: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("default name template invalid: {0}")]
    DefaultTemplate(#[source] TemplateError),

    #[error("profile {name:?} name template invalid: {source}")]
    ProfileTemplate {
        name: String,
        source: TemplateError,
    },
}

/// Raw on-disk document, before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, rename = "defaultProfile")]
    default_profile: Option<String>,
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default, rename = "nameTemplate")]
    name_template: Option<String>,
    #[serde(flatten)]
    spec: serde_json::Map<String, Value>,
}

/// Read and parse the profile file from disk.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&data)
}

/// Parse a profile document.
pub fn parse(data: &str) -> Result<Config, ConfigError> {
    Ok(serde_yaml::from_str(data)?)
}

impl Config {
    /// Validate the document and produce the immutable [`ProfileConfig`].
    ///
    /// `default_name_template` comes from the options record and must itself
    /// render against placeholder data before any profile is accepted.
    pub fn validate(self, default_name_template: &str) -> Result<ProfileConfig, ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }
        let default_profile = self
            .default_profile
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::NoDefaultProfile)?;

        let sample = NameTemplateData::sample();

        template::render_name(default_name_template, &sample)
            .map_err(ConfigError::DefaultTemplate)?;

        let mut profiles = BTreeMap::new();
        for (name, raw) in self.profiles {
            if raw.spec.contains_key("spec") {
                return Err(ConfigError::InvalidProfile {
                    name,
                    reason: "profile spec must be provided inline; the spec field is not supported"
                        .into(),
                });
            }
            if raw.spec.contains_key("targetRef") {
                return Err(ConfigError::InvalidProfile {
                    name,
                    reason: "targetRef is derived from the workload and must not be set".into(),
                });
            }

            let mut spec = Value::Object(raw.spec);
            coerce_update_mode(&mut spec);

            let effective = raw.name_template.as_deref().unwrap_or(default_name_template);
            template::render_name(effective, &sample).map_err(|source| {
                ConfigError::ProfileTemplate {
                    name: name.clone(),
                    source,
                }
            })?;

            profiles.insert(
                name,
                Profile {
                    name_template: raw.name_template,
                    spec,
                },
            );
        }

        if !profiles.contains_key(&default_profile) {
            return Err(ConfigError::DefaultProfileMissing(default_profile));
        }

        Ok(ProfileConfig {
            name_template: default_name_template.to_string(),
            default_profile,
            profiles,
        })
    }
}

/// Coerce legacy boolean `updatePolicy.updateMode` values into the VPA enum:
/// `true` means `"Auto"`, `false` means `"Off"`. String modes pass through.
fn coerce_update_mode(spec: &mut Value) {
    if let Some(policy) = spec.get_mut("updatePolicy").and_then(Value::as_object_mut)
        && let Some(mode) = policy.get("updateMode").and_then(Value::as_bool)
    {
        let coerced = if mode { "Auto" } else { "Off" };
        policy.insert("updateMode".into(), Value::String(coerced.into()));
    }
}
