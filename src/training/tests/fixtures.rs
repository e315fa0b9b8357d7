//! Test fixtures for setting up common test scenarios

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use tempfile::TempDir;

use crate::error::Result;
use crate::models::{
    ClassifierConfig, ClassifierOutput, MeanPoolClassifier, SequenceClassifier, TrainableClassifier,
};
use crate::training::config::{OptimizerType, SchedulerType, TrainingConfig};
use crate::training::data::{BatchAssembler, ClassificationBatch, DataLoader, Example, LabelSet};

pub fn labels() -> LabelSet {
    LabelSet::new(vec!["negative".into(), "positive".into()]).unwrap()
}

pub fn classifier_config(name: &str, hidden_size: usize) -> ClassifierConfig {
    ClassifierConfig {
        name: name.into(),
        vocab_size: 16,
        hidden_size,
        dropout: 0.0,
        id2label: labels().names().to_vec(),
    }
}

pub fn classifier(name: &str, hidden_size: usize, seed: u64) -> MeanPoolClassifier {
    MeanPoolClassifier::new_seeded(classifier_config(name, hidden_size), &Device::Cpu, DType::F32, seed)
        .unwrap()
}

/// Linearly separable toy data: label 0 uses tokens 1..=4, label 1 uses 5..=8
pub fn separable_examples(n: usize) -> Vec<Example> {
    (0..n)
        .map(|i| {
            let label = i % 2;
            let base = 1 + 4 * label as u32;
            let len = 2 + i % 3;
            let ids = (0..len).map(|j| base + ((i + j) % 4) as u32).collect();
            Example::new(ids, label)
        })
        .collect()
}

/// A two-example batch with labels `[0, 1]`
pub fn pair_batch() -> ClassificationBatch {
    BatchAssembler::new(2, 2, 0, Device::Cpu)
        .unwrap()
        .collate(&[Example::new(vec![1, 2], 0), Example::new(vec![5], 1)])
        .unwrap()
}

pub fn loader(examples: Vec<Example>, batch_size: usize, shuffle: bool) -> DataLoader {
    let assembler = BatchAssembler::new(batch_size, 2, 0, Device::Cpu).unwrap();
    DataLoader::from_examples(examples, assembler, shuffle, 11).unwrap()
}

/// Classifier returning fixed logits (or zeros of a given width) and a fixed loss
pub struct FixedLogitsClassifier {
    name: String,
    labels: LabelSet,
    logits: Option<Tensor>,
    width: usize,
    loss: Option<f32>,
    device: Device,
}

impl FixedLogitsClassifier {
    pub fn with_logits(name: &str, rows: &[&[f32]], loss: Option<f32>) -> Self {
        let width = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let logits = Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu).unwrap();
        Self {
            name: name.into(),
            labels: labels(),
            logits: Some(logits),
            width,
            loss,
            device: Device::Cpu,
        }
    }

    /// Zero logits of `width` columns for any batch, while claiming the usual labels
    pub fn zeros(name: &str, width: usize) -> Self {
        Self {
            name: name.into(),
            labels: labels(),
            logits: None,
            width,
            loss: None,
            device: Device::Cpu,
        }
    }
}

impl SequenceClassifier for FixedLogitsClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: &ClassificationBatch, _train: bool) -> Result<ClassifierOutput> {
        let logits = match &self.logits {
            Some(logits) => logits.clone(),
            None => Tensor::zeros((batch.batch_size, self.width), DType::F32, &self.device)?,
        };
        let loss = match self.loss {
            Some(v) => Some(Tensor::new(v, &self.device)?),
            None => None,
        };
        Ok(ClassifierOutput { logits, loss })
    }

    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn place(&mut self, _device: &Device, _dtype: DType) -> Result<()> {
        Ok(())
    }
}

/// Student whose logits turn NaN on the `poison_at`-th training forward pass
pub struct PoisonedStudent {
    inner: MeanPoolClassifier,
    calls: AtomicUsize,
    poison_at: usize,
}

impl PoisonedStudent {
    pub fn new(inner: MeanPoolClassifier, poison_at: usize) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            poison_at,
        }
    }
}

impl SequenceClassifier for PoisonedStudent {
    fn name(&self) -> &str {
        "poisoned"
    }

    fn forward(&self, batch: &ClassificationBatch, train: bool) -> Result<ClassifierOutput> {
        let output = self.inner.forward(batch, train)?;
        if !train || self.calls.fetch_add(1, Ordering::SeqCst) != self.poison_at {
            return Ok(output);
        }
        let logits = output.logits.affine(f64::NAN, 0.0)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        Ok(ClassifierOutput {
            logits,
            loss: Some(loss),
        })
    }

    fn labels(&self) -> &LabelSet {
        self.inner.labels()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn dtype(&self) -> DType {
        self.inner.dtype()
    }

    fn place(&mut self, device: &Device, dtype: DType) -> Result<()> {
        self.inner.place(device, dtype)
    }
}

impl TrainableClassifier for PoisonedStudent {
    fn varmap(&self) -> &VarMap {
        self.inner.varmap()
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        self.inner.varmap_mut()
    }
}

/// Run configuration writing into a temporary directory
pub struct TrainingTestFixture {
    pub temp_dir: TempDir,
    pub config: TrainingConfig,
}

impl TrainingTestFixture {
    pub fn new(num_epochs: usize, batch_size: usize) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = TrainingConfig::default();
        config.training.num_epochs = num_epochs;
        config.training.train_batch_size = batch_size;
        config.training.eval_batch_size = batch_size;
        config.training.log_steps = 1;
        config.optimizer.optimizer_type = OptimizerType::AdamW;
        config.optimizer.learning_rate = 0.05;
        config.optimizer.weight_decay = 0.0;
        config.optimizer.scheduler.scheduler_type = SchedulerType::Constant;
        config.checkpointing.output_dir = temp_dir.path().join("run");
        Self { temp_dir, config }
    }

    /// Checkpoint directories currently on disk, sorted by name
    pub fn checkpoint_dirs(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.config.checkpointing.output_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("checkpoint-"))
            .collect();
        names.sort();
        names
    }
}

/// Flattened values of every parameter, keyed by name
pub fn snapshot(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
    let data = varmap.data().lock().unwrap();
    let mut out: Vec<(String, Vec<f32>)> = data
        .iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), values)
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}
