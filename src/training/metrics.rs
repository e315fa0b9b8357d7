//! Evaluation metrics and the metrics log
//!
//! The training loop only relies on [`MetricEngine`] and on one designated key
//! being present in each [`MetricRecord`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{Tensor, D};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Metric name to scalar value, produced once per evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricRecord(BTreeMap<String, f64>);

impl MetricRecord {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Look up a metric
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Look up a metric that must be present
    pub fn require(&self, name: &str) -> Result<f64> {
        let value = self.get(name).ok_or_else(|| {
            Error::evaluation(format!(
                "metric '{name}' missing from record with keys {:?}",
                self.0.keys().collect::<Vec<_>>()
            ))
        })?;
        if !value.is_finite() {
            return Err(Error::evaluation(format!("metric '{name}' is not finite: {value}")));
        }
        Ok(value)
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    /// Number of metrics
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the record is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for MetricRecord {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Computes a metric record from predictions and references
#[cfg_attr(test, mockall::automock)]
pub trait MetricEngine: Send + Sync {
    /// Compute metrics over a whole evaluation split
    fn compute(&self, predictions: &[u32], references: &[u32]) -> Result<MetricRecord>;
}

/// Accuracy only
#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyMetric;

impl MetricEngine for AccuracyMetric {
    fn compute(&self, predictions: &[u32], references: &[u32]) -> Result<MetricRecord> {
        check_lengths(predictions, references)?;
        let mut record = MetricRecord::new();
        record.insert("accuracy", accuracy(predictions, references));
        Ok(record)
    }
}

/// Accuracy plus macro-averaged F1
#[derive(Debug, Clone, Copy)]
pub struct ClassificationMetrics {
    num_labels: usize,
}

impl ClassificationMetrics {
    /// Metrics over `num_labels` classes
    pub fn new(num_labels: usize) -> Self {
        Self { num_labels }
    }
}

impl MetricEngine for ClassificationMetrics {
    fn compute(&self, predictions: &[u32], references: &[u32]) -> Result<MetricRecord> {
        check_lengths(predictions, references)?;

        let mut tp = vec![0usize; self.num_labels];
        let mut fp = vec![0usize; self.num_labels];
        let mut fn_ = vec![0usize; self.num_labels];

        for (&pred, &gold) in predictions.iter().zip(references) {
            let (p, g) = (pred as usize, gold as usize);
            if p >= self.num_labels || g >= self.num_labels {
                return Err(Error::evaluation(format!(
                    "class index outside [0, {}): prediction {p}, reference {g}",
                    self.num_labels
                )));
            }
            if p == g {
                tp[p] += 1;
            } else {
                fp[p] += 1;
                fn_[g] += 1;
            }
        }

        let f1_sum: f64 = (0..self.num_labels)
            .map(|c| {
                let precision = ratio(tp[c], tp[c] + fp[c]);
                let recall = ratio(tp[c], tp[c] + fn_[c]);
                if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                }
            })
            .sum();

        let mut record = MetricRecord::new();
        record.insert("accuracy", accuracy(predictions, references));
        record.insert("f1_macro", f1_sum / self.num_labels as f64);
        Ok(record)
    }
}

/// Arg-max class per row of `[batch_size, num_labels]` logits
pub fn predictions_from_logits(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}

fn check_lengths(predictions: &[u32], references: &[u32]) -> Result<()> {
    if predictions.len() != references.len() {
        return Err(Error::evaluation(format!(
            "{} predictions for {} references",
            predictions.len(),
            references.len()
        )));
    }
    if predictions.is_empty() {
        return Err(Error::evaluation("no predictions to score"));
    }
    Ok(())
}

fn accuracy(predictions: &[u32], references: &[u32]) -> f64 {
    let correct = predictions.iter().zip(references).filter(|(p, r)| p == r).count();
    correct as f64 / predictions.len() as f64
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// One line of `metrics.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsLogEntry {
    pub epoch: usize,
    pub global_step: usize,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricRecord,
}

/// Appends per-epoch metric records to `<log_dir>/metrics.jsonl`
pub struct MetricsLogger {
    path: PathBuf,
    file: File,
}

impl MetricsLogger {
    /// Start a fresh metrics log in `log_dir`, replacing any earlier one
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Result<Self> {
        std::fs::create_dir_all(log_dir.as_ref())?;
        let path = log_dir.as_ref().join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Append one record
    pub fn log(&mut self, epoch: usize, global_step: usize, metrics: &MetricRecord) -> Result<()> {
        let entry = MetricsLogEntry {
            epoch,
            global_step,
            timestamp: Utc::now(),
            metrics: metrics.clone(),
        };
        writeln!(self.file, "{}", serde_json::to_string(&entry)?)?;
        self.file.flush()?;
        debug!(epoch, path = %self.path.display(), "Appended metrics");
        Ok(())
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
