//! Operator error types

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OperatorError>;

#[derive(Debug, Error, Diagnostic)]
pub enum OperatorError {
    #[error(transparent)]
    #[diagnostic(code(berth::operator::release))]
    Release(#[from] berth_kube::KubeError),

    #[error("chart '{name}' not found in {dir}")]
    #[diagnostic(
        code(berth::operator::chart_not_found),
        help("charts are loaded from <charts-dir>/<chart name>; check BERTH_CHARTS_DIR")
    )]
    ChartNotFound { name: String, dir: String },

    #[error(transparent)]
    #[diagnostic(code(berth::operator::chart))]
    Chart(#[from] berth_core::CoreError),

    #[error("ChartRelease '{0}' has no namespace")]
    #[diagnostic(code(berth::operator::namespace))]
    MissingNamespace(String),

    #[error("Kubernetes API error: {0}")]
    #[diagnostic(code(berth::operator::kube))]
    Kube(#[from] kube::Error),

    #[error("finalizer error: {0}")]
    #[diagnostic(code(berth::operator::finalizer))]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<OperatorError>>),

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(berth::operator::config))]
    Config(String),

    #[error("serialization error: {0}")]
    #[diagnostic(code(berth::operator::serialization))]
    Serialization(#[from] serde_yaml::Error),
}

impl OperatorError {
    /// Whether the error means the release is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::Release(e) if e.is_not_found())
    }
}
