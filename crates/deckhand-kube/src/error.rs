//! Error types for deckhand-kube

use thiserror::Error;

/// Result type for deckhand-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while planning or deploying
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// GVK could not be mapped to a resource, even after a mapper reset
    #[error("no matches for kind '{kind}' in version '{api_version}'")]
    UnresolvedKind { api_version: String, kind: String },

    /// The apiserver rejected a change to an immutable field
    #[error("cannot modify immutable field in {resource}: {message}\nHint: enable recreate-on-immutable to delete and recreate the resource")]
    ImmutableField { resource: String, message: String },

    /// Adding a dependency would create a cycle in the plan
    #[error("dependency from '{from}' to '{to}' would create a cycle")]
    Cycle { from: String, to: String },

    /// Operation id registered twice
    #[error("operation '{0}' already exists in the plan")]
    DuplicateOperation(String),

    /// Operation id not registered
    #[error("operation '{0}' not found in the plan")]
    OperationNotFound(String),

    /// A builder or executor invariant was broken
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A mutator refused a resource
    #[error("mutator '{mutator}' failed for {resource}: {message}")]
    MutatorFailed {
        mutator: String,
        resource: String,
        message: String,
    },

    /// Readiness tracking gave up on a resource
    #[error("{resource} did not become ready: {reason}")]
    ReadinessFailed { resource: String, reason: String },

    /// Timeout
    #[error("operation timed out after {0}")]
    Timeout(String),

    /// One or more plan operations failed
    #[error("{} operation(s) failed:\n{}", .failures.len(), .failures.join("\n"))]
    Execution { failures: Vec<String> },

    /// Release not found
    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    /// Release already exists
    #[error("release '{name}' revision {revision} already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists {
        name: String,
        namespace: String,
        revision: u32,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Core type error
    #[error(transparent)]
    Core(#[from] deckhand_core::CoreError),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<regex::Error> for KubeError {
    fn from(e: regex::Error) -> Self {
        KubeError::InvalidConfig(e.to_string())
    }
}

impl KubeError {
    /// Check if this is a Kubernetes 404 Not Found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Check if this is an immutable-field validation error
    pub fn is_immutable(&self) -> bool {
        match self {
            KubeError::ImmutableField { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => is_immutable_response(resp),
            _ => false,
        }
    }
}

/// Check if an apiserver error response reports an immutable field
///
/// The apiserver answers 422 Invalid with a message such as
/// `spec.selector: Invalid value: ...: field is immutable`.
pub(crate) fn is_immutable_response(resp: &kube::core::ErrorResponse) -> bool {
    resp.code == 422 && resp.message.contains("field is immutable")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str, message: &str) -> KubeError {
        KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: reason.to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404, "NotFound", "configmaps \"x\" not found").is_not_found());
        assert!(!api_error(500, "InternalError", "boom").is_not_found());
    }

    #[test]
    fn test_immutable_detection() {
        let err = api_error(
            422,
            "Invalid",
            "Deployment.apps \"web\" is invalid: spec.selector: Invalid value: {}: field is immutable",
        );
        assert!(err.is_immutable());
        assert!(!api_error(422, "Invalid", "spec.replicas: must be >= 0").is_immutable());
    }

    #[test]
    fn test_execution_error_message() {
        let err = KubeError::Execution {
            failures: vec!["create Deployment/web: boom".to_string(), "x".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 operation(s) failed"));
        assert!(msg.contains("create Deployment/web: boom"));
    }
}
