//! VPA name template rendering.
//!
//! Templates are minijinja expressions over four variables (`WorkloadName`,
//! `Namespace`, `Kind`, `Profile`) plus the builtin `lower`, `replace` and
//! `trim` filters and two custom ones: `truncate` (by character count) and
//! `dns_label` (normalize to DNS-1123-friendly characters). Rendered names
//! must be valid DNS-1123 subdomains; anything else is rejected so a bad
//! template never reaches the API server.

use minijinja::{Environment, UndefinedBehavior, context};
use thiserror::Error;

/// Fields available to name templates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTemplateData {
    pub workload_name: String,
    pub namespace: String,
    pub kind: String,
    pub profile: String,
}

impl NameTemplateData {
    /// Placeholder data used when validating templates at startup.
    pub fn sample() -> Self {
        Self {
            workload_name: "workload".into(),
            namespace: "namespace".into(),
            kind: "Deployment".into(),
            profile: "default".into(),
        }
    }
}

/// Errors produced while rendering or validating a name template.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template must not be empty")]
    Empty,

    #[error("render template: {0}")]
    Render(#[from] minijinja::Error),

    #[error("rendered name {0:?} is not a valid DNS-1123 subdomain")]
    InvalidName(String),
}

/// Render a VPA name template and validate the result.
///
/// Pure: output depends only on the arguments. Unknown variables are
/// render errors, not silently empty strings.
pub fn render_name(template: &str, data: &NameTemplateData) -> Result<String, TemplateError> {
    if template.trim().is_empty() {
        return Err(TemplateError::Empty);
    }

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_filter("truncate", truncate_chars);
    env.add_filter("dns_label", dns_label);

    let name = env.render_str(
        template,
        context! {
            WorkloadName => data.workload_name,
            Namespace => data.namespace,
            Kind => data.kind,
            Profile => data.profile,
        },
    )?;

    if !is_dns1123_subdomain(&name) {
        return Err(TemplateError::InvalidName(name));
    }

    Ok(name)
}

/// Trim a string to at most `n` characters.
fn truncate_chars(value: String, n: usize) -> String {
    value.chars().take(n).collect()
}

/// Normalize a string to a DNS-1123-friendly token.
///
/// Lowercases, maps anything outside `[a-z0-9.-]` to `-`, and strips
/// leading/trailing separators. An empty result falls back to `"vpa"`.
fn dns_label(value: String) -> String {
    let mapped: String = value
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let out = mapped.trim_matches(|c| c == '-' || c == '.');
    if out.is_empty() {
        "vpa".to_string()
    } else {
        out.to_string()
    }
}

/// DNS-1123 subdomain: dot-separated labels of `[a-z0-9-]`, each starting
/// and ending alphanumeric, at most 253 characters total.
pub fn is_dns1123_subdomain(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(is_dns1123_label)
}

fn is_dns1123_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    let bytes = label.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-')
}
