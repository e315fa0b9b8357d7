//! Student optimizer and learning rate schedule
//!
//! Wraps the candle-nn optimizers so the trainer owns a single value for the
//! optimizer state. The schedule is stepped once per optimizer step.

use candle_core::{Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::error::{Error, Result};
use crate::training::config::{OptimizerConfig, OptimizerType, SchedulerType};

/// Optimizer over the student's trainable parameters
pub enum StudentOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl StudentOptimizer {
    /// Build the configured optimizer over `vars`
    pub fn new(config: &OptimizerConfig, vars: Vec<Var>) -> Result<Self> {
        if vars.is_empty() {
            return Err(Error::config("student has no trainable parameters"));
        }
        let optimizer = match config.optimizer_type {
            OptimizerType::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.epsilon,
                    weight_decay: config.weight_decay,
                };
                Self::AdamW(AdamW::new(vars, params)?)
            }
            OptimizerType::Sgd => Self::Sgd(SGD::new(vars, config.learning_rate)?),
        };
        Ok(optimizer)
    }

    /// Backpropagate `loss` and apply one update
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.backward_step(loss)?,
            Self::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    /// Current learning rate
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Override the learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Per-step learning rate schedule
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    kind: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LearningRateScheduler {
    /// Schedule over `total_steps` optimizer steps
    pub fn new(config: &OptimizerConfig, total_steps: usize) -> Self {
        Self {
            kind: config.scheduler.scheduler_type,
            base_lr: config.learning_rate,
            warmup_steps: config.scheduler.warmup_steps,
            total_steps,
        }
    }

    /// Learning rate to use for the 0-based optimizer step `step`
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        match self.kind {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Linear => {
                let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
                let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
                self.base_lr * (1.0 - progress.min(1.0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::config::SchedulerConfig;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn config(kind: SchedulerType, warmup_steps: usize) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: 1.0,
            scheduler: SchedulerConfig {
                scheduler_type: kind,
                warmup_steps,
            },
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn test_constant_schedule() {
        let s = LearningRateScheduler::new(&config(SchedulerType::Constant, 0), 10);
        assert_eq!(s.lr_at(0), 1.0);
        assert_eq!(s.lr_at(9), 1.0);
    }

    #[test]
    fn test_linear_schedule_with_warmup() {
        let s = LearningRateScheduler::new(&config(SchedulerType::Linear, 2), 10);
        assert_abs_diff_eq!(s.lr_at(0), 0.5);
        assert_abs_diff_eq!(s.lr_at(1), 1.0);
        assert_abs_diff_eq!(s.lr_at(2), 1.0);
        assert_abs_diff_eq!(s.lr_at(6), 0.5);
        assert_abs_diff_eq!(s.lr_at(10), 0.0);
    }

    #[test]
    fn test_optimizer_step_moves_parameters() {
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        let mut cfg = config(SchedulerType::Constant, 0);
        cfg.optimizer_type = OptimizerType::Sgd;
        cfg.learning_rate = 0.1;
        let mut opt = StudentOptimizer::new(&cfg, vec![var.clone()]).unwrap();

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.backward_step(&loss).unwrap();

        // x - 0.1 * 2x
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(values[0], 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], -1.6, epsilon = 1e-6);

        opt.set_learning_rate(0.01);
        assert_abs_diff_eq!(opt.learning_rate(), 0.01);
    }

    #[test]
    fn test_no_parameters_is_config_error() {
        let cfg = OptimizerConfig::default();
        assert!(matches!(StudentOptimizer::new(&cfg, Vec::new()), Err(Error::Configuration(_))));
    }
}
