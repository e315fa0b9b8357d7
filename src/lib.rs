//! distilkit - knowledge distillation for sequence classifiers
//!
//! This crate trains a small student classifier to imitate a frozen, already
//! fine-tuned teacher. The loss blends the student's own supervised loss with
//! the divergence between temperature-softened teacher and student outputs;
//! checkpoints are kept under a bounded retention policy and the best one is
//! restored into the student when the run ends.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod logging;
pub mod models;
pub mod training;

// Re-exports
pub use error::{Error, Result};
pub use models::{ClassifierConfig, ClassifierOutput, MeanPoolClassifier, SequenceClassifier, TrainableClassifier};
pub use training::{
    evaluate_classifier, CheckpointManager, ClassificationMetrics, DataLoader, DatasetSplits,
    DistillationConfig, DistillationLoss, DistillationTrainer, ExperimentConfig, LossOutput,
    LossStrategy, MetricEngine, MetricRecord, SupervisedLoss, TrainingConfig, TrainingEvent,
    TrainingResult,
};

/// Crate version reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
