//! Errors raised while processing a document.

use thiserror::Error;

/// A failed processing attempt, as seen by the recovery manager.
///
/// Each variant carries a human-readable message. Recovery doesn't trust the
/// variant alone: it classifies on [`ProcessingError::label`] plus the
/// message, so that an engine error saying "connection refused" is treated as
/// a network problem.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("{0}")]
    Engine(String),

    #[error("{0}")]
    Preprocessing(String),

    #[error("{0}")]
    Extraction(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Resource(String),

    #[error("{0}")]
    Network(String),

    /// Anything else, with the name of the error type it came from.
    #[error("{message}")]
    Other { label: String, message: String },
}

impl ProcessingError {
    /// The error's type name, used for classification and failure logs.
    pub fn label(&self) -> &str {
        match self {
            ProcessingError::Engine(_) => "EngineError",
            ProcessingError::Preprocessing(_) => "PreprocessingError",
            ProcessingError::Extraction(_) => "ExtractionError",
            ProcessingError::Validation(_) => "ValidationError",
            ProcessingError::Timeout(_) => "TimeoutError",
            ProcessingError::Resource(_) => "ResourceError",
            ProcessingError::Network(_) => "NetworkError",
            ProcessingError::Other { label, .. } => label,
        }
    }

    /// Wrap an unexpected error, keeping its full context chain.
    pub fn other(err: &anyhow::Error) -> Self {
        ProcessingError::Other {
            label: "Error".to_owned(),
            message: format!("{err:#}"),
        }
    }
}
