//! Loss strategies for distillation training
//!
//! The final objective is
//!
//! ```text
//! loss = alpha * CE(student, labels) + (1 - alpha) * T^2 * KL(p_teacher^T || p_student^T)
//! ```
//!
//! where `p^T = softmax(logits / T)`. The divergence uses a batch-mean
//! reduction: summed over classes and examples, divided by the batch size.
//! The `T^2` factor keeps gradient magnitudes comparable across temperatures.
//!
//! Plain supervised training and distillation are two [`LossStrategy`]
//! variants selected by [`build_strategy`].

use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;
use tracing::trace;

use crate::error::{Error, Result};
use crate::models::SequenceClassifier;
use crate::training::config::{DistillationConfig, LossStrategyKind};
use crate::training::data::ClassificationBatch;

/// Result of one loss computation
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar to differentiate
    pub loss: Tensor,
    /// Student intrinsic supervised loss
    pub student_loss: Tensor,
    /// Softened divergence before `T^2` scaling; `None` for supervised runs
    pub distillation_loss: Option<Tensor>,
    /// Student logits `[batch_size, num_labels]`
    pub student_logits: Tensor,
}

impl LossOutput {
    /// Host value of the blended loss
    pub fn value(&self) -> Result<f64> {
        scalar(&self.loss)
    }

    /// Host value of the student intrinsic loss
    pub fn student_value(&self) -> Result<f64> {
        scalar(&self.student_loss)
    }

    /// Host value of the divergence term, if computed
    pub fn distillation_value(&self) -> Result<Option<f64>> {
        self.distillation_loss.as_ref().map(scalar).transpose()
    }
}

/// One way of turning a batch into a differentiable scalar
pub trait LossStrategy: Send + Sync {
    /// Strategy name used in logs
    fn name(&self) -> &'static str;

    /// Whether `compute` needs a teacher
    fn requires_teacher(&self) -> bool;

    /// Compute the loss for `batch`. Only the student is run in training mode.
    fn compute(
        &self,
        student: &dyn SequenceClassifier,
        teacher: Option<&dyn SequenceClassifier>,
        batch: &ClassificationBatch,
    ) -> Result<LossOutput>;
}

/// Student intrinsic loss only
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisedLoss;

impl LossStrategy for SupervisedLoss {
    fn name(&self) -> &'static str {
        "supervised"
    }

    fn requires_teacher(&self) -> bool {
        false
    }

    fn compute(
        &self,
        student: &dyn SequenceClassifier,
        _teacher: Option<&dyn SequenceClassifier>,
        batch: &ClassificationBatch,
    ) -> Result<LossOutput> {
        let (student_logits, student_loss) = student_forward(student, batch)?;
        Ok(LossOutput {
            loss: student_loss.clone(),
            student_loss,
            distillation_loss: None,
            student_logits,
        })
    }
}

/// Blend of the intrinsic loss and the softened teacher divergence
#[derive(Debug, Clone, Copy)]
pub struct DistillationLoss {
    alpha: f64,
    temperature: f64,
}

impl DistillationLoss {
    /// Create a distillation strategy; ranges are validated here
    pub fn new(alpha: f64, temperature: f64) -> Result<Self> {
        DistillationConfig::distillation(alpha, temperature).validate()?;
        Ok(Self { alpha, temperature })
    }

    /// Weight of the intrinsic loss
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Softening temperature
    pub fn temperature(&self) -> f64 {
        self.temperature
    }
}

impl LossStrategy for DistillationLoss {
    fn name(&self) -> &'static str {
        "distillation"
    }

    fn requires_teacher(&self) -> bool {
        true
    }

    fn compute(
        &self,
        student: &dyn SequenceClassifier,
        teacher: Option<&dyn SequenceClassifier>,
        batch: &ClassificationBatch,
    ) -> Result<LossOutput> {
        let teacher = teacher
            .ok_or_else(|| Error::config("distillation loss requires a teacher model"))?;
        compute_loss(student, teacher, batch, self.alpha, self.temperature)
    }
}

/// Select the strategy named by the distillation config
pub fn build_strategy(config: &DistillationConfig) -> Result<Box<dyn LossStrategy>> {
    config.validate()?;
    let strategy: Box<dyn LossStrategy> = match config.strategy {
        LossStrategyKind::Supervised => Box::new(SupervisedLoss),
        LossStrategyKind::Distillation => {
            Box::new(DistillationLoss::new(config.alpha, config.temperature)?)
        }
    };
    Ok(strategy)
}

/// Run both models on `batch` and blend their losses.
///
/// The student runs in training mode. The teacher runs in eval mode and its
/// logits are detached, so no gradient reaches teacher parameters.
pub fn compute_loss(
    student: &dyn SequenceClassifier,
    teacher: &dyn SequenceClassifier,
    batch: &ClassificationBatch,
    alpha: f64,
    temperature: f64,
) -> Result<LossOutput> {
    let (student_logits, student_loss) = student_forward(student, batch)?;
    let teacher_logits = teacher.forward(batch, false)?.logits.detach();

    blend_losses(student_loss, student_logits, &teacher_logits, alpha, temperature)
}

/// Blend an intrinsic loss with the divergence between two sets of logits
pub fn blend_losses(
    student_loss: Tensor,
    student_logits: Tensor,
    teacher_logits: &Tensor,
    alpha: f64,
    temperature: f64,
) -> Result<LossOutput> {
    let divergence = kl_divergence(&student_logits, teacher_logits, temperature)?;

    // alpha = 1 still computes the divergence; its coefficient is just 0
    let scaled = divergence.affine((1.0 - alpha) * temperature * temperature, 0.0)?;
    let loss = (student_loss.affine(alpha, 0.0)? + scaled)?;

    trace!(alpha, temperature, "Blended student and distillation losses");

    Ok(LossOutput {
        loss,
        student_loss,
        distillation_loss: Some(divergence),
        student_logits,
    })
}

/// Batch-mean KL divergence of the softened student from the softened teacher.
///
/// Fails with [`Error::ShapeMismatch`] unless both logits have the exact same
/// shape; nothing is broadcast.
pub fn kl_divergence(student_logits: &Tensor, teacher_logits: &Tensor, temperature: f64) -> Result<Tensor> {
    if student_logits.dims() != teacher_logits.dims() {
        return Err(Error::ShapeMismatch {
            student: student_logits.dims().to_vec(),
            teacher: teacher_logits.dims().to_vec(),
        });
    }
    if student_logits.rank() != 2 {
        return Err(Error::shape(format!(
            "logits must be [batch_size, num_labels], got {:?}",
            student_logits.dims()
        )));
    }

    let batch_size = student_logits.dim(0)?;
    if batch_size == 0 {
        return Err(Error::shape("cannot compute divergence over an empty batch"));
    }

    let inv_t = 1.0 / temperature;
    let student_log_probs = log_softmax(&student_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    let teacher_log_probs = log_softmax(&teacher_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    let teacher_probs = teacher_log_probs.exp()?;

    let pointwise = (&teacher_probs * (&teacher_log_probs - &student_log_probs)?)?;
    Ok(pointwise.sum_all()?.affine(1.0 / batch_size as f64, 0.0)?)
}

fn student_forward(student: &dyn SequenceClassifier, batch: &ClassificationBatch) -> Result<(Tensor, Tensor)> {
    let output = student.forward(batch, true)?;
    let loss = match output.loss {
        Some(loss) => loss,
        None => candle_nn::loss::cross_entropy(&output.logits, &batch.labels)?,
    };
    Ok((output.logits, loss))
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}
