//! Batch assembly for classification training
//!
//! Examples are grouped in order into batches of a fixed count. Each batch is
//! padded to its own longest sequence, never to a global maximum.

use candle_core::{Device, Tensor};
use tracing::{debug, instrument};

use super::Example;
use crate::error::{Error, Result};

/// Rectangular batch ready for a forward pass
#[derive(Debug, Clone)]
pub struct ClassificationBatch {
    /// Token ids `[batch_size, seq_len]` (u32)
    pub input_ids: Tensor,
    /// Attention mask `[batch_size, seq_len]` (u32, 1 = real token)
    pub attention_mask: Tensor,
    /// Labels `[batch_size]` (u32)
    pub labels: Tensor,
    /// Host copy of the labels, used by metric computation
    pub label_ids: Vec<u32>,
    /// Number of examples
    pub batch_size: usize,
    /// Padded sequence length
    pub seq_len: usize,
}

impl ClassificationBatch {
    /// Move batch to a different device
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            labels: self.labels.to_device(device)?,
            label_ids: self.label_ids.clone(),
            batch_size: self.batch_size,
            seq_len: self.seq_len,
        })
    }

    /// Device holding the batch tensors
    pub fn device(&self) -> &Device {
        self.input_ids.device()
    }
}

/// Groups examples into padded batches
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    batch_size: usize,
    num_labels: usize,
    pad_token_id: u32,
    device: Device,
}

impl BatchAssembler {
    /// Create a new assembler
    pub fn new(batch_size: usize, num_labels: usize, pad_token_id: u32, device: Device) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be greater than 0"));
        }
        if num_labels == 0 {
            return Err(Error::config("num_labels must be greater than 0"));
        }
        Ok(Self {
            batch_size,
            num_labels,
            pad_token_id,
            device,
        })
    }

    /// Configured number of examples per batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Check every label up front so no bad label reaches the loss
    pub fn validate(&self, examples: &[Example]) -> Result<()> {
        for (i, ex) in examples.iter().enumerate() {
            if ex.label >= self.num_labels {
                return Err(Error::shape(format!(
                    "example {i} has label {} outside [0, {})",
                    ex.label, self.num_labels
                )));
            }
            if ex.input_ids.len() != ex.attention_mask.len() {
                return Err(Error::shape(format!(
                    "example {i} has {} token ids but {} mask entries",
                    ex.input_ids.len(),
                    ex.attention_mask.len()
                )));
            }
        }
        Ok(())
    }

    /// Split `examples` into batches, preserving order
    pub fn assemble(&self, examples: &[Example]) -> Result<Vec<ClassificationBatch>> {
        self.validate(examples)?;
        examples
            .chunks(self.batch_size)
            .map(|chunk| self.collate(chunk))
            .collect()
    }

    /// Pad one group of examples into a batch
    #[instrument(skip(self, examples), fields(n = examples.len()))]
    pub fn collate(&self, examples: &[Example]) -> Result<ClassificationBatch> {
        if examples.is_empty() {
            return Err(Error::shape("cannot collate an empty batch"));
        }
        self.validate(examples)?;

        let batch_size = examples.len();
        let seq_len = examples.iter().map(Example::len).max().unwrap_or(0);
        if seq_len == 0 {
            return Err(Error::shape("every example in the batch is empty"));
        }

        let mut ids = Vec::with_capacity(batch_size * seq_len);
        let mut mask = Vec::with_capacity(batch_size * seq_len);
        let mut label_ids = Vec::with_capacity(batch_size);

        for ex in examples {
            let pad = seq_len - ex.len();
            ids.extend_from_slice(&ex.input_ids);
            ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
            mask.extend_from_slice(&ex.attention_mask);
            mask.extend(std::iter::repeat(0u32).take(pad));
            label_ids.push(ex.label as u32);
        }

        let input_ids = Tensor::from_vec(ids, (batch_size, seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (batch_size, seq_len), &self.device)?;
        let labels = Tensor::from_vec(label_ids.clone(), batch_size, &self.device)?;

        debug!(batch_size, seq_len, "Collated batch");

        Ok(ClassificationBatch {
            input_ids,
            attention_mask,
            labels,
            label_ids,
            batch_size,
            seq_len,
        })
    }
}
