//! Distillation training loop
//!
//! [`DistillationTrainer`] drives the epoch state machine
//!
//! ```text
//! Initialized -> (Training -> Evaluating -> Checkpointing) x num_epochs -> Completed
//! ```
//!
//! and restores the best checkpoint before reporting completion. Any error
//! moves the run to `Failed` and is returned to the caller; checkpoints of
//! completed epochs stay on disk.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::error::{Error, Result};
use crate::models::{check_compatibility, SequenceClassifier, TrainableClassifier};
use crate::training::checkpoints::{CheckpointInfo, CheckpointManager};
use crate::training::config::{DistillationConfig, TrainingConfig};
use crate::training::data::{ClassificationBatch, DataLoader};
use crate::training::loss::{build_strategy, LossStrategy};
use crate::training::metrics::{predictions_from_logits, MetricEngine, MetricRecord, MetricsLogger};
use crate::training::optimizers::{LearningRateScheduler, StudentOptimizer};

/// Trains a student against a frozen teacher
pub struct DistillationTrainer<S: TrainableClassifier> {
    /// Base run configuration
    config: TrainingConfig,

    /// Distillation hyperparameters, fixed for the whole run
    distillation: DistillationConfig,

    /// Trainable student
    student: S,

    /// Frozen teacher; absent for supervised runs
    teacher: Option<Box<dyn SequenceClassifier>>,

    /// Loss selected from the distillation config
    strategy: Box<dyn LossStrategy>,

    /// Metric computation for evaluation passes
    metric_engine: Box<dyn MetricEngine>,

    train_loader: DataLoader,
    eval_loader: DataLoader,

    optimizer: StudentOptimizer,
    scheduler: LearningRateScheduler,

    checkpoints: CheckpointManager,
    metrics_logger: MetricsLogger,

    state: TrainingState,
    device: Device,

    /// Event channel for monitoring
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

/// Phase of the training state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrainingPhase {
    Initialized,
    Training,
    Evaluating,
    Checkpointing,
    Completed,
    Failed { error: String },
}

/// Progress of the current run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (0-based)
    pub epoch: usize,

    /// Current batch within the epoch
    pub step: usize,

    /// Optimizer steps taken
    pub global_step: usize,

    /// Learning rate of the last step
    pub current_lr: f64,

    /// Best designated metric so far
    pub best_metric: Option<f64>,

    /// Current phase
    pub phase: TrainingPhase,
}

impl TrainingState {
    fn new(lr: f64) -> Self {
        Self {
            epoch: 0,
            step: 0,
            global_step: 0,
            current_lr: lr,
            best_metric: None,
            phase: TrainingPhase::Initialized,
        }
    }
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    PhaseChanged { phase: TrainingPhase },
    EpochStarted { epoch: usize, num_batches: usize },
    StepCompleted { epoch: usize, step: usize, loss: f64, lr: f64 },
    EvaluationCompleted { epoch: usize, metrics: MetricRecord },
    CheckpointSaved { epoch: usize, path: PathBuf, is_best: bool },
    BestModelRestored { path: PathBuf },
    TrainingCompleted { total_steps: usize },
    Error { error: String },
}

/// Outcome of a completed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Checkpoint whose weights the student holds now
    pub best_checkpoint: PathBuf,

    /// Designated metric of that checkpoint
    pub best_metric: f64,

    /// Metric record of the best epoch
    pub final_metrics: MetricRecord,

    /// One record per epoch
    pub history: Vec<MetricRecord>,

    /// Optimizer steps taken
    pub total_steps: usize,

    /// Wall-clock duration
    pub duration: Duration,
}

impl<S: TrainableClassifier> DistillationTrainer<S> {
    /// Create a trainer.
    ///
    /// Validates both configs and model compatibility, then places the teacher
    /// and the student on the configured device and precision. Loaders should
    /// already be built over the same label set.
    pub fn new(
        config: TrainingConfig,
        distillation: DistillationConfig,
        mut student: S,
        mut teacher: Option<Box<dyn SequenceClassifier>>,
        train_loader: DataLoader,
        eval_loader: DataLoader,
        metric_engine: Box<dyn MetricEngine>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy = build_strategy(&distillation)?;

        if strategy.requires_teacher() && teacher.is_none() {
            return Err(Error::config(format!(
                "{} loss requires a teacher model",
                strategy.name()
            )));
        }
        if train_loader.is_empty() || eval_loader.is_empty() {
            return Err(Error::config("training and evaluation splits must not be empty"));
        }

        let device = config.runtime.device()?;
        let dtype = config.runtime.dtype();
        if !device.is_cpu() {
            device.set_seed(config.training.seed)?;
        }

        if let Some(teacher) = teacher.as_mut() {
            check_compatibility(&**teacher, &student)?;
            teacher.place(&device, dtype)?;
        }
        student.place(&device, dtype)?;

        // Built after placement, which may replace the parameter map
        let optimizer = StudentOptimizer::new(&config.optimizer, student.varmap().all_vars())?;
        let total_steps = config.training.num_epochs * train_loader.num_batches();
        let scheduler = LearningRateScheduler::new(&config.optimizer, total_steps);

        let checkpoints = CheckpointManager::from_config(&config.checkpointing)?;
        let metrics_logger = MetricsLogger::new(config.log_dir())?;
        let state = TrainingState::new(config.optimizer.learning_rate);

        info!(
            student = student.name(),
            teacher = teacher.as_ref().map(|t| t.name()).unwrap_or("none"),
            strategy = strategy.name(),
            alpha = distillation.alpha,
            temperature = distillation.temperature,
            ?device,
            ?dtype,
            "Trainer initialised"
        );

        Ok(Self {
            config,
            distillation,
            student,
            teacher,
            strategy,
            metric_engine,
            train_loader,
            eval_loader,
            optimizer,
            scheduler,
            checkpoints,
            metrics_logger,
            state,
            device,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every epoch, then restore the best checkpoint into the student
    pub fn train(&mut self) -> Result<TrainingResult> {
        let start = Instant::now();
        info!(
            epochs = self.config.training.num_epochs,
            batches_per_epoch = self.train_loader.num_batches(),
            "Starting distillation training"
        );

        match self.run_training_loop() {
            Ok((best, history)) => {
                self.set_phase(TrainingPhase::Completed);
                let final_metrics = history.get(best.epoch).cloned().unwrap_or_default();
                let result = TrainingResult {
                    best_checkpoint: best.path,
                    best_metric: best.metric,
                    final_metrics,
                    history,
                    total_steps: self.state.global_step,
                    duration: start.elapsed(),
                };
                info!(
                    best_epoch = best.epoch,
                    best_metric = result.best_metric,
                    total_steps = result.total_steps,
                    "Training completed in {:?}",
                    result.duration
                );
                self.send_event(TrainingEvent::TrainingCompleted {
                    total_steps: result.total_steps,
                });
                Ok(result)
            }
            Err(e) => {
                let message = e.to_string();
                error!("Training failed: {message}");
                self.set_phase(TrainingPhase::Failed {
                    error: message.clone(),
                });
                self.send_event(TrainingEvent::Error { error: message });
                Err(e)
            }
        }
    }

    fn run_training_loop(&mut self) -> Result<(CheckpointInfo, Vec<MetricRecord>)> {
        let total_epochs = self.config.training.num_epochs;
        let mut history = Vec::with_capacity(total_epochs);

        for epoch in 0..total_epochs {
            self.state.epoch = epoch;
            info!("Starting epoch {}/{}", epoch + 1, total_epochs);

            self.set_phase(TrainingPhase::Training);
            let train_loss = self.train_epoch(epoch)?;

            self.set_phase(TrainingPhase::Evaluating);
            let mut metrics = self
                .evaluate()
                .map_err(|e| Error::epoch_aborted(epoch, "evaluating", e))?;
            metrics.insert("train_loss", train_loss);
            metrics.insert("epoch", epoch as f64);
            self.send_event(TrainingEvent::EvaluationCompleted {
                epoch,
                metrics: metrics.clone(),
            });

            self.set_phase(TrainingPhase::Checkpointing);
            let info = self
                .checkpoint_epoch(epoch, &metrics)
                .map_err(|e| Error::epoch_aborted(epoch, "checkpointing", e))?;
            self.state.best_metric = self.checkpoints.best_checkpoint().map(|c| c.metric);
            self.send_event(TrainingEvent::CheckpointSaved {
                epoch,
                path: info.path.clone(),
                is_best: info.is_best,
            });

            info!(
                "Epoch {}/{} completed - train_loss: {:.4}, {}: {:.4}",
                epoch + 1,
                total_epochs,
                train_loss,
                self.checkpoints.metric_name(),
                info.metric
            );
            history.push(metrics);
        }

        let best = self.restore_best()?;
        Ok((best, history))
    }

    fn checkpoint_epoch(&mut self, epoch: usize, metrics: &MetricRecord) -> Result<CheckpointInfo> {
        let info = self.checkpoints.save_checkpoint(
            self.student.varmap(),
            epoch,
            self.state.global_step,
            metrics,
        )?;
        self.metrics_logger.log(epoch, self.state.global_step, metrics)?;
        Ok(info)
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<f64> {
        // Batches are collated one at a time; only the order lives for the epoch
        let order = self.train_loader.epoch_order(epoch);
        let num_batches = self.train_loader.num_batches();
        self.send_event(TrainingEvent::EpochStarted { epoch, num_batches });

        let mut total_loss = 0.0;
        for step in 0..num_batches {
            self.state.step = step;
            let loss = self
                .train_loader
                .batch_at(&order, step)
                .and_then(|batch| self.train_step(epoch, step, batch))
                .map_err(|e| Error::aborted(epoch, step, e))?;
            total_loss += loss;
        }

        Ok(total_loss / num_batches.max(1) as f64)
    }

    /// One optimizer step. A non-finite loss aborts before the update.
    fn train_step(&mut self, epoch: usize, step: usize, batch: ClassificationBatch) -> Result<f64> {
        let batch = self.place_batch(batch)?;

        let lr = self.scheduler.lr_at(self.state.global_step);
        self.optimizer.set_learning_rate(lr);

        let output = self
            .strategy
            .compute(&self.student, self.teacher.as_deref(), &batch)?;
        let loss = output.value()?;
        if !loss.is_finite() {
            return Err(Error::NumericalInstability {
                epoch,
                step,
                value: loss,
            });
        }

        self.optimizer.backward_step(&output.loss)?;
        self.state.global_step += 1;
        self.state.current_lr = lr;

        if self.state.global_step % self.config.training.log_steps == 0 {
            info!(
                epoch,
                step,
                global_step = self.state.global_step,
                loss,
                student_loss = output.student_value()?,
                distillation_loss = output.distillation_value()?,
                lr,
                "Training step"
            );
        } else {
            debug!(epoch, step, loss, "Training step");
        }

        self.send_event(TrainingEvent::StepCompleted { epoch, step, loss, lr });
        Ok(loss)
    }

    /// Evaluate the student on the validation split
    pub fn evaluate(&self) -> Result<MetricRecord> {
        self.evaluate_split(&self.eval_loader)
    }

    /// Evaluate the student on any loader.
    ///
    /// Runs the student in eval mode without updates and adds `eval_loss` (mean
    /// intrinsic loss per example) to the engine's record. The designated
    /// metric must be present.
    #[instrument(skip(self, loader), fields(examples = loader.len()))]
    pub fn evaluate_split(&self, loader: &DataLoader) -> Result<MetricRecord> {
        let record = evaluate_classifier(&self.student, loader, self.metric_engine.as_ref())?;
        record.require(&self.config.checkpointing.metric_for_best_model)?;
        debug!(metrics = ?record, "Evaluation completed");
        Ok(record)
    }

    fn restore_best(&mut self) -> Result<CheckpointInfo> {
        let best = self
            .checkpoints
            .best_checkpoint()
            .cloned()
            .ok_or_else(|| Error::checkpoint("no best checkpoint was recorded"))?;

        CheckpointManager::load_weights(&best.path, self.student.varmap_mut())?;
        info!(epoch = best.epoch, path = %best.path.display(), "Restored best checkpoint");
        self.send_event(TrainingEvent::BestModelRestored {
            path: best.path.clone(),
        });
        Ok(best)
    }

    fn place_batch(&self, batch: ClassificationBatch) -> Result<ClassificationBatch> {
        place_batch(batch, &self.device)
    }

    fn set_phase(&mut self, phase: TrainingPhase) {
        debug!(?phase, "Phase transition");
        self.state.phase = phase.clone();
        self.send_event(TrainingEvent::PhaseChanged { phase });
    }

    /// Send training event
    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Current state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The student; after `train` it holds the best checkpoint's weights
    pub fn student(&self) -> &S {
        &self.student
    }

    /// Take the student out of the trainer
    pub fn into_student(self) -> S {
        self.student
    }

    /// Checkpoint manager of this run
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Distillation hyperparameters of this run
    pub fn distillation(&self) -> &DistillationConfig {
        &self.distillation
    }

    /// Device the models were placed on
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Evaluate any classifier on a loader without updating it.
///
/// Returns the engine's record plus `eval_loss`, the mean intrinsic loss per
/// example.
pub fn evaluate_classifier(
    model: &dyn SequenceClassifier,
    loader: &DataLoader,
    metric_engine: &dyn MetricEngine,
) -> Result<MetricRecord> {
    let mut predictions = Vec::with_capacity(loader.len());
    let mut references = Vec::with_capacity(loader.len());
    let mut loss_sum = 0.0;

    for batch in loader.epoch_batches(0) {
        let batch = place_batch(batch?, model.device())?;
        let output = model.forward(&batch, false)?;
        let logits = output.logits.detach();

        let loss = match output.loss {
            Some(loss) => loss.detach(),
            None => candle_nn::loss::cross_entropy(&logits, &batch.labels)?,
        };
        let loss = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        loss_sum += loss * batch.batch_size as f64;

        predictions.extend(predictions_from_logits(&logits)?);
        references.extend_from_slice(&batch.label_ids);
    }

    let mut record = metric_engine
        .compute(&predictions, &references)
        .map_err(|e| match e {
            Error::Evaluation(_) => e,
            other => Error::evaluation(other.to_string()),
        })?;

    let eval_loss = loss_sum / references.len().max(1) as f64;
    if !eval_loss.is_finite() {
        return Err(Error::evaluation(format!("eval_loss is not finite: {eval_loss}")));
    }
    record.insert("eval_loss", eval_loss);
    Ok(record)
}

fn place_batch(batch: ClassificationBatch, device: &Device) -> Result<ClassificationBatch> {
    if batch.device().same_device(device) {
        Ok(batch)
    } else {
        batch.to_device(device)
    }
}
