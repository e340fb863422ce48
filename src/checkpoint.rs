//! Checkpoint persistence and early-stop bookkeeping.
//!
//! Layout under `<checkpoint_dir>/<subdirectory>/`:
//!
//! - `model.safetensors`: parameters of the best epoch so far
//! - `state.json`: [`CheckpointState`] of that epoch
//! - `epochs.jsonl`: one [`EpochRecord`] per finished epoch
//!
//! The store keeps the best validation error and the number of consecutive
//! epochs without improvement. A checkpoint is written only when an epoch
//! strictly improves on the best error.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CompeteError, Result};

const MODEL_FILE: &str = "model.safetensors";
const STATE_FILE: &str = "state.json";
const EPOCH_LOG: &str = "epochs.jsonl";

/// Metadata stored next to the model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Optimizer steps taken when the checkpoint was written.
    pub global_step: u64,
    /// Zero-based epoch that produced the checkpoint.
    pub epoch: usize,
    /// Validation error of that epoch.
    pub best_val_error: f64,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
}

/// Summary of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub global_step: u64,
    /// Wall time spent in the epoch, in seconds.
    pub elapsed_secs: f64,
    /// Loss of the last executed step; `None` if no step ran.
    pub train_error: Option<f64>,
    /// Mean validation error.
    pub val_error: f64,
    /// Consecutive non-improving epochs after this one.
    pub early_stop_counter: usize,
    /// Whether this epoch produced a checkpoint.
    pub improved: bool,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
}

/// Reads and writes checkpoints for the parameters in a [`VarMap`].
pub struct CheckpointStore {
    root: PathBuf,
    var_map: VarMap,
    best_val_error: Option<f64>,
    counter: usize,
}

impl CheckpointStore {
    /// Create a store rooted at `root`, persisting `var_map`.
    ///
    /// `var_map` is a handle; clones share the same variables.
    pub fn new(root: impl Into<PathBuf>, var_map: VarMap) -> Self {
        Self {
            root: root.into(),
            var_map,
            best_val_error: None,
            counter: 0,
        }
    }

    /// Directory of one run's checkpoint.
    pub fn run_dir(&self, subdirectory: &Path) -> PathBuf {
        self.root.join(subdirectory)
    }

    /// Whether a checkpoint exists for `subdirectory`.
    pub fn has_checkpoint(&self, subdirectory: &Path) -> bool {
        self.run_dir(subdirectory).join(STATE_FILE).is_file()
    }

    /// Restore the checkpoint of `subdirectory` into the parameter store.
    ///
    /// Returns the stored global step, or 0 when there is no checkpoint (the
    /// parameters are then left untouched).
    pub fn load(&mut self, subdirectory: &Path) -> Result<u64> {
        let dir = self.run_dir(subdirectory);
        let state_path = dir.join(STATE_FILE);
        if !state_path.is_file() {
            tracing::info!("No checkpoint in {}; starting fresh", dir.display());
            return Ok(0);
        }

        let state: CheckpointState = serde_json::from_str(&fs::read_to_string(&state_path)?)?;
        let model_path = dir.join(MODEL_FILE);
        if !model_path.is_file() {
            return Err(CompeteError::Checkpoint(format!(
                "{} exists but {} is missing",
                state_path.display(),
                model_path.display()
            )));
        }
        self.var_map.load(&model_path)?;

        self.best_val_error = Some(state.best_val_error);
        self.counter = 0;
        tracing::info!(
            "Restored checkpoint from {} (epoch {}, step {}, val error {:.6})",
            dir.display(),
            state.epoch,
            state.global_step,
            state.best_val_error
        );
        Ok(state.global_step)
    }

    /// Record a finished epoch and write a checkpoint if it improved.
    ///
    /// Returns the number of consecutive non-improving epochs, 0 when this
    /// epoch improved.
    pub fn save(
        &mut self,
        epoch: usize,
        global_step: u64,
        elapsed: Duration,
        train_error: Option<f64>,
        val_error: f64,
        subdirectory: &Path,
    ) -> Result<usize> {
        let dir = self.run_dir(subdirectory);
        fs::create_dir_all(&dir)?;

        let improved = self.best_val_error.map_or(true, |best| val_error < best);
        if improved {
            self.write_checkpoint(&dir, epoch, global_step, val_error)?;
            self.best_val_error = Some(val_error);
            self.counter = 0;
        } else {
            self.counter += 1;
        }

        let record = EpochRecord {
            epoch,
            global_step,
            elapsed_secs: elapsed.as_secs_f64(),
            train_error: train_error.filter(|v| v.is_finite()),
            val_error,
            early_stop_counter: self.counter,
            improved,
            timestamp: Utc::now(),
        };
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EPOCH_LOG))?;
        writeln!(log, "{}", serde_json::to_string(&record)?)?;

        Ok(self.counter)
    }

    /// Best validation error seen, if any epoch has been recorded or loaded.
    pub fn best_val_error(&self) -> Option<f64> {
        self.best_val_error
    }

    /// Read back the epoch log of `subdirectory`.
    pub fn epoch_log(&self, subdirectory: &Path) -> Result<Vec<EpochRecord>> {
        let path = self.run_dir(subdirectory).join(EPOCH_LOG);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                records.push(serde_json::from_str(&line)?);
            }
        }
        Ok(records)
    }

    fn write_checkpoint(
        &self,
        dir: &Path,
        epoch: usize,
        global_step: u64,
        val_error: f64,
    ) -> Result<()> {
        self.var_map.save(dir.join(MODEL_FILE))?;
        let state = CheckpointState {
            global_step,
            epoch,
            best_val_error: val_error,
            saved_at: Utc::now(),
        };
        fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(&state)?)?;
        tracing::info!(
            "Saved checkpoint to {} (epoch {}, val error {:.6})",
            dir.display(),
            epoch,
            val_error
        );
        Ok(())
    }
}
