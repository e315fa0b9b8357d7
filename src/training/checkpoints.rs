//! Checkpoint persistence and best-model selection
//!
//! Layout under the output directory:
//!
//! ```text
//! checkpoint-<epoch>/model.safetensors   student weights
//! checkpoint-<epoch>/checkpoint.json     epoch, step, metric record, timestamp
//! trainer_state.json                     best pointer, global step, log history
//! ```
//!
//! After every save the retained set is the `save_total_limit` most recent
//! checkpoints plus the best one, which is never evicted. A checkpoint only
//! becomes best when it strictly improves on the previous best.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::models::classifier::WEIGHTS_FILE;
use crate::models::load_varmap;
use crate::training::config::CheckpointingConfig;
use crate::training::metrics::MetricRecord;

/// Metadata file inside a checkpoint directory
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Run state file in the output directory
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

/// Contents of `checkpoint.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
    /// Epoch index (0-based)
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Evaluation metrics of this epoch
    pub metrics: MetricRecord,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

/// A retained checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Epoch index (0-based)
    pub epoch: usize,
    /// Optimizer steps taken so far
    pub global_step: usize,
    /// Checkpoint directory
    pub path: PathBuf,
    /// Value of the designated metric
    pub metric: f64,
    /// Whether this is the current best checkpoint
    pub is_best: bool,
}

/// Contents of `trainer_state.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub metric_for_best_model: String,
    pub greater_is_better: bool,
    pub best_checkpoint: Option<PathBuf>,
    pub best_metric: Option<f64>,
    pub global_step: usize,
    pub retained: Vec<PathBuf>,
    pub log_history: Vec<TrainingCheckpoint>,
}

/// Owns the checkpoints of one run and the pointer to the best one
#[derive(Debug)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: usize,
    metric_name: String,
    greater_is_better: bool,
    /// Retained checkpoints, oldest first
    retained: Vec<CheckpointInfo>,
    log_history: Vec<TrainingCheckpoint>,
}

impl CheckpointManager {
    /// Create a manager rooted at `output_dir`.
    ///
    /// Fails if `output_dir` already holds checkpoints or a trainer state from
    /// an earlier run.
    pub fn new<P: AsRef<Path>>(
        output_dir: P,
        save_total_limit: usize,
        metric_name: impl Into<String>,
        greater_is_better: bool,
    ) -> Result<Self> {
        Self::open(output_dir, save_total_limit, metric_name, greater_is_better, false)
    }

    /// Create a manager from the checkpointing section of a run config
    pub fn from_config(config: &CheckpointingConfig) -> Result<Self> {
        Self::open(
            &config.output_dir,
            config.save_total_limit,
            config.metric_for_best_model.clone(),
            config.greater_is_better,
            config.overwrite_output_dir,
        )
    }

    fn open<P: AsRef<Path>>(
        output_dir: P,
        save_total_limit: usize,
        metric_name: impl Into<String>,
        greater_is_better: bool,
        overwrite: bool,
    ) -> Result<Self> {
        if save_total_limit == 0 {
            return Err(Error::config("save_total_limit must be greater than 0"));
        }
        let output_dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&output_dir)?;

        let stale = previous_run_artifacts(&output_dir)?;
        if !stale.is_empty() {
            if !overwrite {
                return Err(Error::config(format!(
                    "{} already holds {} checkpoint artifact(s) from an earlier run; \
                     choose another output_dir or set overwrite_output_dir",
                    output_dir.display(),
                    stale.len()
                )));
            }
            for path in &stale {
                if path.is_dir() {
                    std::fs::remove_dir_all(path)?;
                } else {
                    std::fs::remove_file(path)?;
                }
            }
            warn!(
                dir = %output_dir.display(),
                removed = stale.len(),
                "Cleared checkpoints of an earlier run"
            );
        }

        Ok(Self {
            output_dir,
            save_total_limit,
            metric_name: metric_name.into(),
            greater_is_better,
            retained: Vec::new(),
            log_history: Vec::new(),
        })
    }

    /// Output directory
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Designated metric name
    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    /// Whether `value` strictly beats the current best
    pub fn is_improvement(&self, value: f64) -> bool {
        match self.best_checkpoint() {
            None => true,
            Some(best) if self.greater_is_better => value > best.metric,
            Some(best) => value < best.metric,
        }
    }

    /// Persist the student weights for `epoch`, update the best pointer and
    /// evict checkpoints that fall outside the retention bound.
    #[instrument(skip(self, varmap, metrics), fields(dir = %self.output_dir.display()))]
    pub fn save_checkpoint(
        &mut self,
        varmap: &VarMap,
        epoch: usize,
        global_step: usize,
        metrics: &MetricRecord,
    ) -> Result<CheckpointInfo> {
        let metric = metrics.require(&self.metric_name)?;

        let path = self.output_dir.join(format!("checkpoint-{epoch}"));
        std::fs::create_dir_all(&path)?;
        varmap
            .save(path.join(WEIGHTS_FILE))
            .map_err(|e| Error::checkpoint(format!("{}: {e}", path.display())))?;

        let record = TrainingCheckpoint {
            epoch,
            global_step,
            metrics: metrics.clone(),
            timestamp: Utc::now(),
        };
        std::fs::write(path.join(CHECKPOINT_FILE), serde_json::to_string_pretty(&record)?)?;
        self.log_history.push(record);

        let is_best = self.is_improvement(metric);
        if is_best {
            for info in &mut self.retained {
                info.is_best = false;
            }
            info!(epoch, metric = %self.metric_name, value = metric, "New best checkpoint");
        }

        // Re-saving an epoch replaces its entry
        self.retained.retain(|c| c.path != path);
        let info = CheckpointInfo {
            epoch,
            global_step,
            path,
            metric,
            is_best,
        };
        self.retained.push(info.clone());

        self.enforce_retention()?;
        self.write_state(global_step)?;

        debug!(epoch, retained = self.retained.len(), "Checkpoint saved");
        Ok(info)
    }

    /// The current best checkpoint
    pub fn best_checkpoint(&self) -> Option<&CheckpointInfo> {
        self.retained.iter().find(|c| c.is_best)
    }

    /// Retained checkpoints, oldest first
    pub fn list_checkpoints(&self) -> &[CheckpointInfo] {
        &self.retained
    }

    /// Every `checkpoint.json` written so far this run
    pub fn log_history(&self) -> &[TrainingCheckpoint] {
        &self.log_history
    }

    /// Read the metadata of any checkpoint directory
    pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<TrainingCheckpoint> {
        let file = path.as_ref().join(CHECKPOINT_FILE);
        let content = std::fs::read_to_string(&file)
            .map_err(|e| Error::checkpoint(format!("{}: {e}", file.display())))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load the weights of any checkpoint directory into `varmap`
    pub fn load_weights<P: AsRef<Path>>(path: P, varmap: &mut VarMap) -> Result<()> {
        let file = path.as_ref().join(WEIGHTS_FILE);
        if !file.exists() {
            return Err(Error::checkpoint(format!("{} does not exist", file.display())));
        }
        load_varmap(varmap, &file).map_err(|e| Error::checkpoint(format!("{}: {e}", file.display())))
    }

    /// Read `trainer_state.json` from an output directory
    pub fn read_state<P: AsRef<Path>>(output_dir: P) -> Result<TrainerState> {
        let file = output_dir.as_ref().join(TRAINER_STATE_FILE);
        let content = std::fs::read_to_string(&file)
            .map_err(|e| Error::checkpoint(format!("{}: {e}", file.display())))?;
        Ok(serde_json::from_str(&content)?)
    }

    fn enforce_retention(&mut self) -> Result<()> {
        let keep_from = self.retained.len().saturating_sub(self.save_total_limit);

        let mut kept = Vec::with_capacity(self.retained.len());
        for (i, info) in self.retained.drain(..).enumerate() {
            if i >= keep_from || info.is_best {
                kept.push(info);
                continue;
            }
            if info.path.exists() {
                std::fs::remove_dir_all(&info.path).map_err(|e| {
                    Error::checkpoint(format!("failed to evict {}: {e}", info.path.display()))
                })?;
                debug!(epoch = info.epoch, "Evicted checkpoint");
            } else {
                warn!(path = %info.path.display(), "Evicted checkpoint was already gone");
            }
        }
        self.retained = kept;
        Ok(())
    }

    fn write_state(&self, global_step: usize) -> Result<()> {
        let best = self.best_checkpoint();
        let state = TrainerState {
            metric_for_best_model: self.metric_name.clone(),
            greater_is_better: self.greater_is_better,
            best_checkpoint: best.map(|c| c.path.clone()),
            best_metric: best.map(|c| c.metric),
            global_step,
            retained: self.retained.iter().map(|c| c.path.clone()).collect(),
            log_history: self.log_history.clone(),
        };

        let tmp = self.output_dir.join(format!("{TRAINER_STATE_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_string_pretty(&state)?)?;
        std::fs::rename(&tmp, self.output_dir.join(TRAINER_STATE_FILE))?;
        Ok(())
    }
}

/// `checkpoint-*` directories and the trainer state of an earlier run
fn previous_run_artifacts(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let path = entry?.path();
        let is_checkpoint = path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("checkpoint-"));
        if is_checkpoint || path.ends_with(TRAINER_STATE_FILE) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}
