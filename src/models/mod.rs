//! Teacher and student classifier abstractions
//!
//! The training engine only talks to models through [`SequenceClassifier`].
//! A student additionally exposes its [`VarMap`] so the optimizer and the
//! checkpoint manager can reach its parameters.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::error::{Error, Result};
use crate::training::data::{ClassificationBatch, LabelSet};

pub mod classifier;

pub use classifier::{ClassifierConfig, MeanPoolClassifier};

/// Output of one classifier forward pass
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    /// Unnormalised class scores `[batch_size, num_labels]`, F32
    pub logits: Tensor,
    /// Intrinsic supervised loss against `batch.labels`, when computed
    pub loss: Option<Tensor>,
}

/// A sequence classifier with a fixed label mapping
pub trait SequenceClassifier: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Run a forward pass. `train` enables dropout.
    fn forward(&self, batch: &ClassificationBatch, train: bool) -> Result<ClassifierOutput>;

    /// Label-index-to-name mapping
    fn labels(&self) -> &LabelSet;

    /// Label cardinality
    fn num_labels(&self) -> usize {
        self.labels().len()
    }

    /// Device holding the parameters
    fn device(&self) -> &Device;

    /// Parameter dtype
    fn dtype(&self) -> DType;

    /// Move parameters to `device` / `dtype`. Calling it twice is a no-op.
    fn place(&mut self, device: &Device, dtype: DType) -> Result<()>;
}

/// A classifier whose parameters receive gradients
pub trait TrainableClassifier: SequenceClassifier {
    /// Trainable parameters
    fn varmap(&self) -> &VarMap;

    /// Mutable access, used when restoring weights from a checkpoint
    fn varmap_mut(&mut self) -> &mut VarMap;
}

/// Teacher and student must agree on label cardinality and ordering
pub fn check_compatibility(
    teacher: &dyn SequenceClassifier,
    student: &dyn SequenceClassifier,
) -> Result<()> {
    if teacher.num_labels() != student.num_labels() {
        return Err(Error::config(format!(
            "label cardinality mismatch: teacher '{}' has {}, student '{}' has {}",
            teacher.name(),
            teacher.num_labels(),
            student.name(),
            student.num_labels()
        )));
    }

    if teacher.labels() != student.labels() {
        return Err(Error::config(format!(
            "label mapping mismatch: teacher '{}' {:?} vs student '{}' {:?}",
            teacher.name(),
            teacher.labels().names(),
            student.name(),
            student.labels().names()
        )));
    }

    Ok(())
}

/// A model must use exactly the dataset's label mapping
pub fn check_label_mapping(model: &dyn SequenceClassifier, labels: &LabelSet) -> Result<()> {
    if model.labels() != labels {
        return Err(Error::config(format!(
            "model '{}' labels {:?} do not match dataset labels {:?}",
            model.name(),
            model.labels().names(),
            labels.names()
        )));
    }
    Ok(())
}

/// Overwrite every parameter of `varmap` from a safetensors file.
///
/// Stored tensors are converted to each parameter's dtype and device, so
/// weights saved in F32 load into an F16 or BF16 model.
pub fn load_varmap(varmap: &VarMap, path: &Path) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::model_loading("parameter map lock poisoned"))?;

    for (name, var) in data.iter() {
        let stored = tensors.get(name).ok_or_else(|| {
            Error::model_loading(format!("{} has no tensor '{name}'", path.display()))
        })?;
        let converted = stored.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&converted)?;
    }
    Ok(())
}
