//! Error types for the controllers.
//!
//! Classification drives retry behavior: transient API errors requeue with
//! backoff, NotFound means convergence, and configuration problems never
//! reach this type at all (they are reported and swallowed so a bad profile
//! cannot hot-loop a workload).

use std::time::Duration;

use thiserror::Error;

use crate::template::TemplateError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// VPA name template failure
    #[error("name template error: {0}")]
    Template(#[from] TemplateError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required metadata field was absent on an API object
    #[error("missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on conflicts, rate limiting, server errors and
                // transport failures.
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Template(_) | Error::Serialization(_) | Error::MissingObjectKey(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }

    /// Short reason label for the error counter.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube(_) => "api",
            Error::Template(_) => "template",
            Error::Serialization(_) => "serialization",
            Error::MissingObjectKey(_) => "missing_key",
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
