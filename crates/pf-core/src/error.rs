//! Pipeline-level errors and their serializable form

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::export::ExportError;
use crate::graph::GraphError;
use crate::request::ValidationError;

/// Any error a single request can end in
///
/// Environment failures are not here: they stop the process at startup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("Geometry kernel unavailable: {0}")]
    KernelUnavailable(String),
}

/// Failure category reported to the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Graph,
    KernelTimeout,
    Geometry,
    Cancelled,
    Export,
    KernelUnavailable,
    /// The request exceeded its wall-clock limit
    Timeout,
    /// The build panicked
    Internal,
}

/// Serializable description of a failed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl BuildFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node: None,
            field: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("Request exceeded its limit of {:?}", limit))
    }
}

impl std::fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for BuildFailure {}

impl From<&PipelineError> for BuildFailure {
    fn from(error: &PipelineError) -> Self {
        let message = error.to_string();
        match error {
            PipelineError::Validation(e) => Self {
                field: Some(e.field.clone()),
                ..Self::new(FailureKind::Validation, message)
            },
            PipelineError::Graph(e) => Self {
                node: e.node().map(str::to_string),
                ..Self::new(FailureKind::Graph, message)
            },
            PipelineError::Engine(e) => {
                let kind = match e {
                    EngineError::KernelTimeout { .. } => FailureKind::KernelTimeout,
                    EngineError::Geometry { .. } => FailureKind::Geometry,
                    EngineError::Cancelled { .. } => FailureKind::Cancelled,
                };
                Self {
                    node: Some(e.node().to_string()),
                    ..Self::new(kind, message)
                }
            }
            PipelineError::Export(_) => Self::new(FailureKind::Export, message),
            PipelineError::KernelUnavailable(_) => Self::new(FailureKind::KernelUnavailable, message),
        }
    }
}

impl From<PipelineError> for BuildFailure {
    fn from(error: PipelineError) -> Self {
        Self::from(&error)
    }
}
