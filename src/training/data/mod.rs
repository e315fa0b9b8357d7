//! Data loading infrastructure for distillation training
//!
//! This module provides the example and label types, split loading from JSONL,
//! the tokenizer contract shared by teacher and student, and the batch
//! assembler that turns variable-length examples into padded tensors.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod batching;
pub mod datasets;
pub mod loaders;
pub mod tokenization;

// Re-exports
pub use batching::{BatchAssembler, ClassificationBatch};
pub use datasets::{comparison_texts, load_labels, load_texts, DatasetSplits, LabeledSplit};
pub use loaders::{DataLoader, EpochBatches};
pub use tokenization::{ensure_equivalent, HfTokenizer, TextEncoder};

/// A single tokenised example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Token ids, unpadded
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding
    pub attention_mask: Vec<u32>,
    /// Label index in `[0, num_labels)`
    pub label: usize,
}

impl Example {
    /// Example with a full attention mask
    pub fn new(input_ids: Vec<u32>, label: usize) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            input_ids,
            attention_mask,
            label,
        }
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the example has no tokens
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Ordered label names; the position of a name is its label index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet {
    names: Vec<String>,
}

impl LabelSet {
    /// Build a label set, rejecting empty or duplicated names
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::config("label set must contain at least one label"));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(Error::config(format!("duplicate label name '{name}'")));
            }
        }
        Ok(Self { names })
    }

    /// Label cardinality
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false for a constructed set
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name of a label index
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Index of a label name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// All names in index order
    pub fn names(&self) -> &[String] {
        &self.names
    }
}
