//! Mean-pooled embedding classifier
//!
//! embedding -> masked mean pooling -> pre-classifier (tanh) -> dropout ->
//! classifier. Teacher and student share the architecture and differ in
//! width; a model directory holds `config.json` and `model.safetensors`.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{load_varmap, ClassifierOutput, SequenceClassifier, TrainableClassifier};
use crate::error::{Error, Result};
use crate::training::data::{ClassificationBatch, LabelSet};

/// Weights file inside a model directory
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Config file inside a model directory
pub const CONFIG_FILE: &str = "config.json";

/// Architecture and label mapping of a [`MeanPoolClassifier`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Model name used in logs
    pub name: String,
    /// Vocabulary size of the shared tokenizer
    pub vocab_size: usize,
    /// Embedding and pre-classifier width
    pub hidden_size: usize,
    /// Dropout probability applied before the classifier
    #[serde(default)]
    pub dropout: f32,
    /// Label names in index order
    pub id2label: Vec<String>,
}

impl ClassifierConfig {
    /// Read `config.json`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::model_loading(format!("{}: {e}", path.as_ref().display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 {
            return Err(Error::config(format!(
                "model '{}' needs non-zero vocab_size and hidden_size",
                self.name
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!(
                "model '{}' dropout must be in [0, 1), got {}",
                self.name, self.dropout
            )));
        }
        Ok(())
    }
}

/// Embedding-bag style sequence classifier built on candle
pub struct MeanPoolClassifier {
    config: ClassifierConfig,
    labels: LabelSet,
    varmap: VarMap,
    embeddings: Embedding,
    pre_classifier: Linear,
    classifier: Linear,
    dropout: Dropout,
    device: Device,
    dtype: DType,
}

impl MeanPoolClassifier {
    /// Fresh model with weights drawn from a seeded normal distribution
    pub fn new_seeded(config: ClassifierConfig, device: &Device, dtype: DType, seed: u64) -> Result<Self> {
        let model = Self::build(config, VarMap::new(), device, dtype)?;
        model.reinitialize(seed)?;
        Ok(model)
    }

    /// Load a model directory.
    ///
    /// When `model.safetensors` is missing the model is initialised from
    /// `seed`, unless `require_weights` is set.
    pub fn load<P: AsRef<Path>>(
        dir: P,
        device: &Device,
        dtype: DType,
        require_weights: bool,
        seed: u64,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config = ClassifierConfig::from_file(dir.join(CONFIG_FILE))?;
        let weights = dir.join(WEIGHTS_FILE);

        if !weights.exists() {
            if require_weights {
                return Err(Error::model_loading(format!(
                    "{} is required but missing",
                    weights.display()
                )));
            }
            info!(model = %config.name, seed, "No weights found, initialising from seed");
            return Self::new_seeded(config, device, dtype, seed);
        }

        let mut model = Self::build(config, VarMap::new(), device, dtype)?;
        model.load_weights(&weights)?;
        info!(
            model = %model.config.name,
            path = %weights.display(),
            hidden_size = model.config.hidden_size,
            "Loaded classifier weights"
        );
        Ok(model)
    }

    /// Overwrite the parameters from a safetensors file
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        load_varmap(&self.varmap, path)
            .map_err(|e| Error::model_loading(format!("{}: {e}", path.display())))
    }

    /// Write `config.json` and `model.safetensors` into `dir`
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&self.config)?)?;
        let weights = dir.join(WEIGHTS_FILE);
        self.varmap.save(&weights)?;
        Ok(weights)
    }

    /// Model configuration
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Total number of parameters
    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn build(config: ClassifierConfig, varmap: VarMap, device: &Device, dtype: DType) -> Result<Self> {
        config.validate()?;
        let labels = LabelSet::new(config.id2label.clone())?;
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let embeddings = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embeddings"))?;
        let pre_classifier =
            candle_nn::linear(config.hidden_size, config.hidden_size, vb.pp("pre_classifier"))?;
        let classifier = candle_nn::linear(config.hidden_size, labels.len(), vb.pp("classifier"))?;
        let dropout = Dropout::new(config.dropout);

        Ok(Self {
            config,
            labels,
            varmap,
            embeddings,
            pre_classifier,
            classifier,
            dropout,
            device: device.clone(),
            dtype,
        })
    }

    /// Deterministic init: N(0, 0.02) weights, zero biases
    fn reinitialize(&self, seed: u64) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::model_loading("parameter map lock poisoned"))?;

        let mut names: Vec<&String> = data.keys().collect();
        names.sort();

        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0f32, 0.02)
            .map_err(|e| Error::model_loading(format!("invalid init distribution: {e}")))?;

        for name in names {
            let var = &data[name];
            let n = var.elem_count();
            let values: Vec<f32> = if name.ends_with(".bias") {
                vec![0.0; n]
            } else {
                (0..n).map(|_| normal.sample(&mut rng)).collect()
            };
            let init = Tensor::from_vec(values, var.dims(), &self.device)?.to_dtype(self.dtype)?;
            var.set(&init)?;
        }
        Ok(())
    }
}

impl SequenceClassifier for MeanPoolClassifier {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn forward(&self, batch: &ClassificationBatch, train: bool) -> Result<ClassifierOutput> {
        let hidden = self.embeddings.forward(&batch.input_ids)?;

        // Masked mean over the sequence axis
        let mask = batch.attention_mask.to_dtype(self.dtype)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1.0)?;
        let pooled = summed.broadcast_div(&counts)?;

        let x = self.pre_classifier.forward(&pooled)?.tanh()?;
        let x = self.dropout.forward(&x, train)?;
        let logits = self.classifier.forward(&x)?.to_dtype(DType::F32)?;

        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;

        Ok(ClassifierOutput {
            logits,
            loss: Some(loss),
        })
    }

    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn place(&mut self, device: &Device, dtype: DType) -> Result<()> {
        if self.device.same_device(device) && self.dtype == dtype {
            return Ok(());
        }

        let placed = VarMap::new();
        {
            let source = self
                .varmap
                .data()
                .lock()
                .map_err(|_| Error::model_loading("parameter map lock poisoned"))?;
            let mut target = placed
                .data()
                .lock()
                .map_err(|_| Error::model_loading("parameter map lock poisoned"))?;
            for (name, var) in source.iter() {
                let moved = var.as_tensor().to_device(device)?.to_dtype(dtype)?;
                target.insert(name.clone(), Var::from_tensor(&moved)?);
            }
        }

        debug!(model = %self.config.name, ?dtype, "Placed parameters on new device");
        *self = Self::build(self.config.clone(), placed, device, dtype)?;
        Ok(())
    }
}

impl TrainableClassifier for MeanPoolClassifier {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}
