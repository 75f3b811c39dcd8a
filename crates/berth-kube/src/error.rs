//! Error types for berth-kube

use thiserror::Error;

use crate::release::StoredRelease;

/// Result type for berth-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during release management
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// No release record with this name (or version) exists
    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    /// Records exist but none of them is deployed
    #[error("release '{name}' has no deployed version in namespace '{namespace}'")]
    NoDeployedRelease { name: String, namespace: String },

    /// Release already exists
    #[error("release '{name}' already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists { name: String, namespace: String },

    /// Another operation is in progress
    #[error("another operation is in progress for release '{name}': {status}")]
    OperationInProgress { name: String, status: String },

    #[error("invalid release name '{name}': {reason}")]
    InvalidReleaseName { name: String, reason: String },

    /// Rollback not possible
    #[error("cannot rollback release '{name}': {reason}")]
    RollbackNotPossible { name: String, reason: String },

    /// A caller-supplied action option refused to apply
    #[error("failed to apply {action} option: {message}")]
    OptionRejected { action: &'static str, message: String },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Chart loading error
    #[error("chart error: {0}")]
    Chart(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Patch calculation error
    #[error("failed to create patch for {object}: {message}")]
    Patch { object: String, message: String },

    /// A cluster object operation failed
    #[error("failed to {action} {object}: {message}")]
    ObjectOperation {
        action: &'static str,
        object: String,
        message: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Timeout
    #[error("operation timed out after {0}")]
    Timeout(String),

    /// The caller cancelled the operation
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// An error annotated with the operation and release it happened in
    #[error("failed to {operation} for release '{name}': {source}")]
    Context {
        operation: String,
        name: String,
        #[source]
        source: Box<KubeError>,
    },

    /// Install failed; compensation, if any was needed, succeeded
    #[error("failed to install release: {0}")]
    InstallFailed(#[source] Box<KubeError>),

    /// Upgrade failed; compensation, if any was needed, succeeded
    #[error("failed to upgrade release: {0}")]
    UpgradeFailed(#[source] Box<KubeError>),

    /// Install failed and the compensating uninstall failed too
    #[error("failed installation ({install}) and failed rollback: {uninstall}")]
    InstallRollbackFailed {
        install: Box<KubeError>,
        #[source]
        uninstall: Box<KubeError>,
    },

    /// Upgrade failed and the compensating rollback failed too
    #[error("failed upgrade ({upgrade}) and failed rollback: {rollback}")]
    UpgradeRollbackFailed {
        upgrade: Box<KubeError>,
        #[source]
        rollback: Box<KubeError>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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

impl From<berth_core::CoreError> for KubeError {
    fn from(e: berth_core::CoreError) -> Self {
        KubeError::Chart(e.to_string())
    }
}

impl From<berth_engine::EngineError> for KubeError {
    fn from(e: berth_engine::EngineError) -> Self {
        KubeError::Template(e.to_string())
    }
}

impl KubeError {
    /// Whether this error means "the release (or its deployed version) does not exist"
    ///
    /// Looks through `Context` wrappers and also matches Kubernetes 404 responses.
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::ReleaseNotFound { .. } | KubeError::NoDeployedRelease { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            KubeError::Context { source, .. }
            | KubeError::InstallFailed(source)
            | KubeError::UpgradeFailed(source) => source.is_not_found(),
            _ => false,
        }
    }

    /// Check if this is a conflict error (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            KubeError::Cancelled { .. } => true,
            KubeError::Context { source, .. }
            | KubeError::InstallFailed(source)
            | KubeError::UpgradeFailed(source) => source.is_cancelled(),
            _ => false,
        }
    }

    /// Wrap with the operation and release name
    pub fn context(self, operation: impl Into<String>, name: impl Into<String>) -> Self {
        KubeError::Context {
            operation: operation.into(),
            name: name.into(),
            source: Box::new(self),
        }
    }
}

/// A failed release action, with the record it left behind (if any)
///
/// `partial` is set once the action has persisted a record, meaning cluster
/// state may have been mutated and the caller should compensate.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ActionFailure {
    #[source]
    pub error: KubeError,
    pub partial: Option<Box<StoredRelease>>,
}

impl ActionFailure {
    pub fn partial(error: KubeError, release: StoredRelease) -> Self {
        Self {
            error,
            partial: Some(Box::new(release)),
        }
    }
}

impl From<KubeError> for ActionFailure {
    fn from(error: KubeError) -> Self {
        Self {
            error,
            partial: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found() -> KubeError {
        KubeError::ReleaseNotFound {
            name: "web".into(),
            namespace: "default".into(),
        }
    }

    #[test]
    fn test_not_found_through_context() {
        assert!(not_found().is_not_found());
        assert!(not_found().context("get release history", "web").is_not_found());
        assert!(
            KubeError::NoDeployedRelease {
                name: "web".into(),
                namespace: "default".into()
            }
            .is_not_found()
        );
        assert!(!KubeError::Storage("boom".into()).is_not_found());
    }

    #[test]
    fn test_combined_messages() {
        let err = KubeError::InstallRollbackFailed {
            install: Box::new(KubeError::Storage("install broke".into())),
            uninstall: Box::new(KubeError::Storage("uninstall broke".into())),
        };
        assert_eq!(
            err.to_string(),
            "failed installation (storage error: install broke) and failed rollback: storage error: uninstall broke"
        );

        let err = KubeError::UpgradeRollbackFailed {
            upgrade: Box::new(KubeError::Timeout("30s".into())),
            rollback: Box::new(KubeError::Storage("gone".into())),
        };
        assert!(err.to_string().starts_with("failed upgrade (operation timed out after 30s)"));
        assert!(err.to_string().ends_with("failed rollback: storage error: gone"));
    }

    #[test]
    fn test_context_message() {
        let err = KubeError::Storage("connection refused".into()).context("delete stale release version", "web");
        assert_eq!(
            err.to_string(),
            "failed to delete stale release version for release 'web': storage error: connection refused"
        );
    }

    #[test]
    fn test_action_failure_from_error() {
        let failure: ActionFailure = KubeError::Timeout("1s".into()).into();
        assert!(failure.partial.is_none());
        assert_eq!(failure.to_string(), "operation timed out after 1s");
    }
}
