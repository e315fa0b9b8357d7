//! Error types for distillation runs
//!
//! Every variant is fatal for the run that raised it. Nothing in the crate
//! retries or recovers locally: a configuration, shape, numerical or
//! evaluation failure aborts training and leaves completed checkpoints on disk.

use thiserror::Error;

/// Main error type for distilkit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid run configuration, detected before training starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A batch could not be assembled (label out of range, empty batch, ...)
    #[error("Shape error: {0}")]
    Shape(String),

    /// Teacher and student produced logits of different shapes
    #[error("Shape mismatch: student logits {student:?} vs teacher logits {teacher:?}")]
    ShapeMismatch {
        /// Student logits dimensions
        student: Vec<usize>,
        /// Teacher logits dimensions
        teacher: Vec<usize>,
    },

    /// A batch produced a NaN or infinite loss
    #[error("Numerical instability: non-finite loss {value} at epoch {epoch}, step {step}")]
    NumericalInstability {
        /// Epoch index (0-based)
        epoch: usize,
        /// Batch index within the epoch
        step: usize,
        /// Offending loss value
        value: f64,
    },

    /// Metric computation failed during an evaluation pass
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A fatal error raised while processing a specific batch
    #[error("Run aborted at epoch {epoch}, batch {step}: {source}")]
    Aborted {
        /// Epoch index (0-based)
        epoch: usize,
        /// Batch index within the epoch
        step: usize,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A fatal error raised while evaluating or checkpointing an epoch
    #[error("Run aborted at epoch {epoch} while {phase}: {source}")]
    EpochAborted {
        /// Epoch index (0-based)
        epoch: usize,
        /// Phase that failed (`evaluating`, `checkpointing`)
        phase: &'static str,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Checkpoint persistence error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Dataset loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Model loading error
    #[error("Model loading error: {0}")]
    ModelLoading(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for distilkit operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a batch shape error
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::Shape(msg.into())
    }

    /// Create an evaluation error
    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a tokenizer error
    pub fn tokenizer(msg: impl Into<String>) -> Self {
        Self::Tokenizer(msg.into())
    }

    /// Create a model loading error
    pub fn model_loading(msg: impl Into<String>) -> Self {
        Self::ModelLoading(msg.into())
    }

    /// Attach the batch location to a fatal error
    pub fn aborted(epoch: usize, step: usize, source: Error) -> Self {
        Self::Aborted {
            epoch,
            step,
            source: Box::new(source),
        }
    }

    /// Attach the epoch and phase to a fatal error outside the batch loop
    pub fn epoch_aborted(epoch: usize, phase: &'static str, source: Error) -> Self {
        Self::EpochAborted {
            epoch,
            phase,
            source: Box::new(source),
        }
    }

    /// Epoch the run was in when the error was raised, if known
    pub fn epoch(&self) -> Option<usize> {
        match self {
            Self::Aborted { epoch, .. }
            | Self::EpochAborted { epoch, .. }
            | Self::NumericalInstability { epoch, .. } => Some(*epoch),
            _ => None,
        }
    }

    /// The innermost error, looking through [`Error::Aborted`] and [`Error::EpochAborted`]
    pub fn root(&self) -> &Error {
        match self {
            Self::Aborted { source, .. } | Self::EpochAborted { source, .. } => source.root(),
            other => other,
        }
    }
}
