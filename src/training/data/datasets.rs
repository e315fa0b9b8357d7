//! Dataset splits and JSONL loading
//!
//! A data directory holds `labels.json` (ordered label names, shared by every
//! split), `train.jsonl`, `validation.jsonl` and optionally `test.jsonl`.

use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::{Example, LabelSet, TextEncoder};
use crate::error::{Error, Result};

/// One named split of labelled examples
#[derive(Debug, Clone)]
pub struct LabeledSplit {
    /// Split name (`train`, `validation`, `test`)
    pub name: String,
    /// Examples in file order
    pub examples: Vec<Example>,
}

impl LabeledSplit {
    /// Build a split, checking every label against the label set
    pub fn new(name: impl Into<String>, examples: Vec<Example>, labels: &LabelSet) -> Result<Self> {
        let name = name.into();
        if let Some((i, ex)) = examples
            .iter()
            .enumerate()
            .find(|(_, ex)| ex.label >= labels.len())
        {
            return Err(Error::shape(format!(
                "{name} example {i} has label {} outside [0, {})",
                ex.label,
                labels.len()
            )));
        }
        Ok(Self { name, examples })
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the split is empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

/// Training, validation and test splits with their shared label mapping
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training split
    pub train: LabeledSplit,
    /// Validation split, evaluated every epoch
    pub validation: LabeledSplit,
    /// Held-out test split
    pub test: Option<LabeledSplit>,
    /// Label mapping attached once for all splits
    pub labels: LabelSet,
}

/// A JSONL record: either raw text or pre-tokenised ids, plus a label
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    input_ids: Option<Vec<u32>>,
    label: LabelValue,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelValue {
    Index(usize),
    Name(String),
}

impl DatasetSplits {
    /// Load every split from `dir`, tokenising text records with `encoder`
    pub fn load<P: AsRef<Path>>(dir: P, encoder: &dyn TextEncoder, max_length: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let labels = load_labels(&dir.join("labels.json"))?;

        let train = load_split(&dir.join("train.jsonl"), "train", &labels, encoder, max_length)?;
        let validation = load_split(
            &dir.join("validation.jsonl"),
            "validation",
            &labels,
            encoder,
            max_length,
        )?;

        let test_path = dir.join("test.jsonl");
        let test = if test_path.exists() {
            Some(load_split(&test_path, "test", &labels, encoder, max_length)?)
        } else {
            None
        };

        if train.is_empty() {
            return Err(Error::data("training split is empty"));
        }
        if validation.is_empty() {
            return Err(Error::data("validation split is empty"));
        }

        info!(
            train = train.len(),
            validation = validation.len(),
            test = test.as_ref().map(LabeledSplit::len).unwrap_or(0),
            num_labels = labels.len(),
            "Dataset loaded"
        );

        Ok(Self {
            train,
            validation,
            test,
            labels,
        })
    }

    /// Number of labels shared by all splits
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }
}

/// Read `labels.json` (a JSON array of names)
pub fn load_labels(path: &Path) -> Result<LabelSet> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::data(format!("{}: {e}", path.display())))?;
    let names: Vec<String> = serde_json::from_str(&content)?;
    LabelSet::new(names)
}

/// Read the raw texts of a split without tokenising them
pub fn load_texts(path: &Path, limit: usize) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::data(format!("{}: {e}", path.display())))?;
    let mut texts = Vec::new();
    for line in BufReader::new(file).lines() {
        if texts.len() >= limit {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(line.trim())?;
        if let Some(text) = record.text {
            texts.push(text);
        }
    }
    Ok(texts)
}

/// Texts for comparing tokenizers when a dataset carries no raw text
pub const BUILTIN_COMPARISON_TEXTS: &[&str] = &[
    "The quick brown fox jumps over the lazy dog.",
    "I absolutely loved this movie, the acting was superb!",
    "Worst purchase ever; it broke after two days :(",
    "Prices rose 3.5% in Q2 2023, according to the report.",
    "don't can't won't it's we're they'll",
    "Visit https://example.com or email support@example.com",
    "naïve café résumé jalapeño",
    "  leading and trailing whitespace  ",
    "UPPERCASE lowercase MiXeD CaSe",
    "1234567890 + 42 = 1234567932",
];

/// Texts used to compare the teacher and student tokenizers.
///
/// Takes text records from `train.jsonl`, then `validation.jsonl`, then
/// `test.jsonl`, up to `limit`. A fully pre-tokenised dataset falls back to
/// [`BUILTIN_COMPARISON_TEXTS`].
pub fn comparison_texts(data_dir: &Path, limit: usize) -> Result<Vec<String>> {
    let mut texts = Vec::new();
    for file in ["train.jsonl", "validation.jsonl", "test.jsonl"] {
        let path = data_dir.join(file);
        if texts.len() >= limit || !path.exists() {
            continue;
        }
        texts.extend(load_texts(&path, limit - texts.len())?);
    }

    if texts.is_empty() {
        debug!(dir = %data_dir.display(), "No raw text in dataset, using built-in comparison texts");
        texts = BUILTIN_COMPARISON_TEXTS.iter().map(|t| t.to_string()).collect();
    }
    Ok(texts)
}

fn load_split(
    path: &Path,
    name: &str,
    labels: &LabelSet,
    encoder: &dyn TextEncoder,
    max_length: usize,
) -> Result<LabeledSplit> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::data(format!("{}: {e}", path.display())))?;

    let mut examples = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: RawRecord = serde_json::from_str(trimmed).map_err(|e| {
            Error::data(format!("{}:{}: {e}", path.display(), line_no + 1))
        })?;
        examples.push(parse_record(record, labels, encoder, max_length).map_err(|e| {
            Error::data(format!("{}:{}: {e}", path.display(), line_no + 1))
        })?);
    }

    LabeledSplit::new(name, examples, labels)
}

fn parse_record(
    record: RawRecord,
    labels: &LabelSet,
    encoder: &dyn TextEncoder,
    max_length: usize,
) -> Result<Example> {
    let label = match record.label {
        LabelValue::Index(i) => i,
        LabelValue::Name(name) => labels
            .index_of(&name)
            .ok_or_else(|| Error::shape(format!("unknown label name '{name}'")))?,
    };

    let mut input_ids = match (record.input_ids, record.text) {
        (Some(ids), _) => ids,
        (None, Some(text)) => encoder.encode(&text)?,
        (None, None) => return Err(Error::data("record has neither text nor input_ids")),
    };
    input_ids.truncate(max_length);

    if input_ids.is_empty() {
        return Err(Error::data("record produced no tokens"));
    }

    Ok(Example::new(input_ids, label))
}
