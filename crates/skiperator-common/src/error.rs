//! Error types for the Skiperator operator
//!
//! Errors carry the context needed to surface them on a parent's status: the
//! object kind and name for cluster write failures, the parent for derivation
//! failures. `is_retryable()` drives the controllers' error policy.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Skiperator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict while writing a child object
    #[error("conflict writing {kind} {name}: object was modified concurrently")]
    Conflict {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
    },

    /// Desired state could not be derived from the parent spec
    #[error("derivation error for {parent}: {message}")]
    Derivation {
        /// Name of the parent whose spec could not be derived
        parent: String,
        /// Description of what could not be derived
        message: String,
    },

    /// A child object is controlled by another owner
    #[error("{kind} {name} is already controlled by {owner}")]
    Ownership {
        /// Kind of the child object
        kind: String,
        /// Name of the child object
        name: String,
        /// Description of the foreign controller
        owner: String,
    },

    /// Cluster-level configuration the operator depends on is missing or invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of the missing configuration
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },
}

impl Error {
    /// Create a derivation error without parent context
    pub fn derivation(msg: impl Into<String>) -> Self {
        Self::Derivation {
            parent: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a derivation error for a specific parent
    pub fn derivation_for(parent: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Derivation {
            parent: parent.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a conflict error for a child object
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an ownership error for a child object
    pub fn ownership(
        kind: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::Ownership {
            kind: kind.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Check if this error is retryable
    ///
    /// Transient cluster errors (conflicts, throttling, server errors, lost
    /// connections) and missing cluster configuration are retried quickly.
    /// Derivation and ownership errors need a change to a spec or to a
    /// referenced object before they can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Conflict { .. } => true,
            Error::Config { .. } => true,
            Error::Derivation { .. } => false,
            Error::Ownership { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Whether the error is expected to clear on its own with a retry.
    ///
    /// Narrower than [`Error::is_retryable`]: missing cluster configuration
    /// is retried but still reported, while a lost write race or an API
    /// server hiccup is not worth surfacing to the user.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube { .. } => self.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a concurrent writer bumps the resourceVersion under us
    ///
    /// The synchronizer turns a 409 into a Conflict, which must be retried
    /// rather than surfaced as a user facing failure.
    #[test]
    fn story_conflicts_are_retried() {
        let err = Error::conflict("Deployment", "my-app");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Deployment my-app"));

        let err: Error = api_error(409).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn story_transient_api_errors_are_retried() {
        assert!(Error::from(api_error(429)).is_retryable());
        assert!(Error::from(api_error(503)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
    }

    /// Story: a bad access policy reference waits for a spec or cluster change
    #[test]
    fn story_derivation_errors_name_the_parent() {
        let err = Error::derivation_for("my-app", "service other/backend not found");
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "derivation error for my-app: service other/backend not found"
        );
    }

    #[test]
    fn missing_cluster_config_is_retryable() {
        let err = Error::config("configmap skiperator-system/gcp-identity-config not found");
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("configuration error"));
    }

    #[test]
    fn foreign_ownership_is_permanent() {
        let err = Error::ownership("Service", "my-app", "Application other-app");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("already controlled by Application other-app"));
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { kind: None, .. }));
    }
}
