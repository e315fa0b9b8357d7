//! Distillation training infrastructure
//!
//! This module provides the run configuration, data loading and batch
//! assembly, the loss strategies, evaluation metrics, checkpointing with
//! best-model selection, and the training loop that ties them together.
//!
//! # Main Components
//!
//! - **Configuration**: base run configuration plus separate distillation hyperparameters
//! - **Data**: JSONL splits, tokenizer contract, batch assembler and loaders
//! - **Loss**: supervised and distillation [`LossStrategy`] variants
//! - **Checkpoints**: bounded retention with a pinned best checkpoint
//! - **Trainer**: the epoch state machine in [`DistillationTrainer`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use distilkit::training::{DistillationConfig, DistillationTrainer, TrainingConfig};
//!
//! let mut trainer = DistillationTrainer::new(
//!     TrainingConfig::default(),
//!     DistillationConfig::distillation(0.5, 2.0),
//!     student,
//!     Some(Box::new(teacher)),
//!     train_loader,
//!     eval_loader,
//!     Box::new(ClassificationMetrics::new(2)),
//! )?;
//! let result = trainer.train()?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod trainer;

#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    CheckpointingConfig, DataConfig, DeviceType, DistillationConfig, ExperimentConfig,
    LoggingConfig, LossStrategyKind, OptimizerConfig, OptimizerType, PrecisionType, RuntimeConfig,
    SchedulerConfig, SchedulerType, TrainingConfig, TrainingParams,
};

// Trainer re-exports
pub use trainer::{
    evaluate_classifier, DistillationTrainer, TrainingEvent, TrainingPhase, TrainingResult,
    TrainingState,
};

// Data re-exports
pub use data::{
    BatchAssembler, ClassificationBatch, DataLoader, DatasetSplits, Example, LabelSet, LabeledSplit,
};

// Checkpoint re-exports
pub use checkpoints::{CheckpointInfo, CheckpointManager, TrainerState, TrainingCheckpoint};

// Metrics re-exports
pub use metrics::{AccuracyMetric, ClassificationMetrics, MetricEngine, MetricRecord, MetricsLogger};

// Loss re-exports
pub use loss::{
    blend_losses, build_strategy, compute_loss, kl_divergence, DistillationLoss, LossOutput,
    LossStrategy, SupervisedLoss,
};

// Optimizer re-exports
pub use optimizers::{LearningRateScheduler, StudentOptimizer};
