//! Run configuration for distillation training
//!
//! The base run configuration ([`TrainingConfig`]) and the distillation
//! hyperparameters ([`DistillationConfig`]) are separate structs. The trainer
//! receives both side by side; [`ExperimentConfig`] only exists to keep them in
//! one file on disk.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Base run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Core loop parameters
    pub training: TrainingParams,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Checkpoint retention and best-model selection
    pub checkpointing: CheckpointingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Device and precision placement
    pub runtime: RuntimeConfig,

    /// Dataset location and preprocessing
    pub data: DataConfig,
}

/// Core training parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,

    /// Batch size for training
    pub train_batch_size: usize,

    /// Batch size for evaluation
    pub eval_batch_size: usize,

    /// Seed for shuffling and weight initialisation
    pub seed: u64,

    /// Logging frequency (in steps)
    pub log_steps: usize,

    /// Shuffle the training split every epoch
    pub shuffle: bool,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Weight decay coefficient (AdamW only)
    pub weight_decay: f64,

    /// Beta1 parameter for AdamW
    pub beta1: f64,

    /// Beta2 parameter for AdamW
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,

    /// Learning rate schedule
    pub scheduler: SchedulerConfig,
}

/// Optimizer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    AdamW,
    Sgd,
}

/// Learning rate scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Scheduler type
    pub scheduler_type: SchedulerType,

    /// Warmup steps
    pub warmup_steps: usize,
}

/// Learning rate scheduler types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Constant,
    Linear,
}

/// Checkpointing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Directory receiving checkpoints and final weights
    pub output_dir: PathBuf,

    /// Maximum number of non-pinned checkpoints kept on disk
    pub save_total_limit: usize,

    /// Metric used to select the best checkpoint
    pub metric_for_best_model: String,

    /// Whether higher values of the metric are better
    pub greater_is_better: bool,

    /// Restore the best checkpoint when training completes
    pub load_best_model_at_end: bool,

    /// Delete checkpoints and state left in `output_dir` by an earlier run
    pub overwrite_output_dir: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for `metrics.jsonl`; defaults to the output directory
    pub log_dir: Option<PathBuf>,

    /// Emit JSON log lines
    pub json: bool,
}

/// Device and precision placement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Compute device
    pub device: DeviceType,

    /// Parameter precision
    pub precision: PrecisionType,
}

/// Device types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda { ordinal: usize },
    Metal { ordinal: usize },
}

/// Precision types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionType {
    F32,
    F16,
    BF16,
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding `train.jsonl`, `validation.jsonl`, `test.jsonl` and `labels.json`
    pub data_dir: PathBuf,

    /// Truncation length for tokenised text
    pub max_length: usize,

    /// Token id used for padding
    pub pad_token_id: u32,

    /// Number of training texts used to compare teacher and student tokenizers
    pub tokenizer_probe_size: usize,
}

/// Which loss strategy drives the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossStrategyKind {
    /// Student intrinsic loss only, no teacher required
    Supervised,
    /// Blend of intrinsic loss and softened teacher divergence
    Distillation,
}

/// Distillation hyperparameters.
///
/// `alpha` and `temperature` carry no defaults on purpose; a config file that
/// omits them fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Loss strategy
    #[serde(default = "default_strategy")]
    pub strategy: LossStrategyKind,

    /// Weight of the student's own supervised loss, in [0, 1]
    pub alpha: f64,

    /// Softening temperature, > 0
    pub temperature: f64,
}

fn default_strategy() -> LossStrategyKind {
    LossStrategyKind::Distillation
}

/// On-disk experiment file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Base run configuration
    #[serde(default)]
    pub run: TrainingConfig,

    /// Distillation hyperparameters
    pub distillation: DistillationConfig,

    /// Directory of the fine-tuned teacher (`config.json`, `model.safetensors`, `tokenizer.json`)
    pub teacher_model_dir: Option<PathBuf>,

    /// Directory of the student (`config.json`, optional `model.safetensors`, `tokenizer.json`)
    pub student_model_dir: PathBuf,
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.training.num_epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }

        if self.training.train_batch_size == 0 || self.training.eval_batch_size == 0 {
            return Err(Error::config("Batch sizes must be greater than 0"));
        }

        if self.training.log_steps == 0 {
            return Err(Error::config("Log steps must be greater than 0"));
        }

        if !(self.optimizer.learning_rate > 0.0 && self.optimizer.learning_rate.is_finite()) {
            return Err(Error::config("Learning rate must be positive and finite"));
        }

        if self.optimizer.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }

        if self.checkpointing.save_total_limit == 0 {
            return Err(Error::config("Checkpoint retention limit must be greater than 0"));
        }

        if self.checkpointing.metric_for_best_model.trim().is_empty() {
            return Err(Error::config("A metric for best-model selection is required"));
        }

        if !self.checkpointing.load_best_model_at_end {
            return Err(Error::config(
                "load_best_model_at_end cannot be disabled: the best checkpoint is always restored",
            ));
        }

        if self.data.max_length == 0 {
            return Err(Error::config("max_length must be greater than 0"));
        }

        Ok(())
    }

    /// Directory for the metrics log
    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .log_dir
            .clone()
            .unwrap_or_else(|| self.checkpointing.output_dir.clone())
    }
}

impl DistillationConfig {
    /// Distillation with the given weights
    pub fn distillation(alpha: f64, temperature: f64) -> Self {
        Self {
            strategy: LossStrategyKind::Distillation,
            alpha,
            temperature,
        }
    }

    /// Plain supervised training; the teacher is never consulted
    pub fn supervised() -> Self {
        Self {
            strategy: LossStrategyKind::Supervised,
            alpha: 1.0,
            temperature: 1.0,
        }
    }

    /// Validate hyperparameter ranges
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(Error::config(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }

        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(Error::config(format!(
                "temperature must be a finite value > 0, got {}",
                self.temperature
            )));
        }

        Ok(())
    }

    /// Whether the run needs a teacher model
    pub fn requires_teacher(&self) -> bool {
        self.strategy == LossStrategyKind::Distillation
    }
}

impl RuntimeConfig {
    /// Resolve the configured device
    pub fn device(&self) -> Result<Device> {
        let device = match self.device {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda { ordinal } => Device::new_cuda(ordinal)?,
            DeviceType::Metal { ordinal } => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }

    /// Resolve the configured parameter dtype
    pub fn dtype(&self) -> DType {
        match self.precision {
            PrecisionType::F32 => DType::F32,
            PrecisionType::F16 => DType::F16,
            PrecisionType::BF16 => DType::BF16,
        }
    }
}

impl ExperimentConfig {
    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        let config = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = if path.as_ref().extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };

        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate both halves and the model wiring
    pub fn validate(&self) -> Result<()> {
        self.run.validate()?;
        self.distillation.validate()?;

        if self.distillation.requires_teacher() && self.teacher_model_dir.is_none() {
            return Err(Error::config(
                "distillation strategy requires teacher_model_dir",
            ));
        }

        Ok(())
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            train_batch_size: 16,
            eval_batch_size: 16,
            seed: 42,
            log_steps: 10,
            shuffle: true,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::AdamW,
            learning_rate: 2e-5,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::Linear,
            warmup_steps: 0,
        }
    }
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./distilled"),
            save_total_limit: 2,
            metric_for_best_model: "accuracy".to_string(),
            greater_is_better: true,
            load_best_model_at_end: true,
            overwrite_output_dir: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            json: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceType::Cpu,
            precision: PrecisionType::F32,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            max_length: 128,
            pad_token_id: 0,
            tokenizer_probe_size: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    fn experiment() -> ExperimentConfig {
        ExperimentConfig {
            run: TrainingConfig::default(),
            distillation: DistillationConfig::distillation(0.5, 2.0),
            teacher_model_dir: Some(PathBuf::from("models/teacher")),
            student_model_dir: PathBuf::from("models/student"),
        }
    }

    #[test]
    fn test_default_config() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.checkpointing.metric_for_best_model, "accuracy");
        assert!(config.checkpointing.greater_is_better);
    }

    #[test_case(0.0, 1.0, true ; "alpha zero")]
    #[test_case(1.0, 0.5, true ; "alpha one")]
    #[test_case(-0.1, 2.0, false ; "alpha negative")]
    #[test_case(1.5, 2.0, false ; "alpha above one")]
    #[test_case(0.5, 0.0, false ; "temperature zero")]
    #[test_case(0.5, -1.0, false ; "temperature negative")]
    #[test_case(f64::NAN, 2.0, false ; "alpha nan")]
    fn test_distillation_validation(alpha: f64, temperature: f64, ok: bool) {
        let config = DistillationConfig::distillation(alpha, temperature);
        let result = config.validate();
        assert_eq!(result.is_ok(), ok);
        if let Err(err) = result {
            assert!(matches!(err, Error::Configuration(_)));
        }
    }

    #[test]
    fn test_missing_alpha_fails_to_parse() {
        let yaml = "distillation:\n  temperature: 2.0\nstudent_model_dir: s\n";
        assert!(serde_yaml::from_str::<ExperimentConfig>(yaml).is_err());

        let yaml = "distillation:\n  alpha: 0.5\nstudent_model_dir: s\n";
        assert!(serde_yaml::from_str::<ExperimentConfig>(yaml).is_err());
    }

    #[test]
    fn test_partial_run_section_uses_defaults() {
        let yaml = "run:\n  training:\n    num_epochs: 7\ndistillation:\n  alpha: 0.5\n  temperature: 2.0\nstudent_model_dir: s\n";
        let config: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run.training.num_epochs, 7);
        assert_eq!(config.run.training.train_batch_size, 16);
        assert_eq!(config.distillation.strategy, LossStrategyKind::Distillation);
    }

    #[test]
    fn test_config_file_operations() {
        let dir = TempDir::new().unwrap();
        let config = experiment();

        let json_path = dir.path().join("run.json");
        config.to_file(&json_path).unwrap();
        let loaded = ExperimentConfig::from_file(&json_path).unwrap();
        assert_eq!(loaded.distillation, config.distillation);

        let yaml_path = dir.path().join("run.yaml");
        config.to_file(&yaml_path).unwrap();
        let loaded = ExperimentConfig::from_file(&yaml_path).unwrap();
        assert_eq!(loaded.run.training.num_epochs, config.run.training.num_epochs);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainingConfig::default();
        config.training.num_epochs = 0;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.optimizer.learning_rate = -0.1;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.checkpointing.save_total_limit = 0;
        assert!(config.validate().is_err());

        config = TrainingConfig::default();
        config.checkpointing.load_best_model_at_end = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_distillation_requires_teacher_dir() {
        let mut config = experiment();
        config.teacher_model_dir = None;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.distillation = DistillationConfig::supervised();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_runtime_resolution() {
        let runtime = RuntimeConfig::default();
        assert!(runtime.device().unwrap().is_cpu());
        assert_eq!(runtime.dtype(), DType::F32);
    }
}
