//! Scalar summaries for one training run, one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const SUMMARY_FILE: &str = "scalars.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    /// Global step the value belongs to.
    pub step: u64,
    /// Series name, e.g. `train/loss`.
    pub tag: String,
    /// Value; `None` for non-finite values.
    pub value: Option<f64>,
    /// Unix time in seconds.
    pub wall_time: f64,
}

/// Appends [`ScalarEvent`]s to `<log_dir>/<subdirectory>/scalars.jsonl`.
pub struct SummaryWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SummaryWriter {
    /// Open (or continue) the summary file of a run.
    pub fn create(log_dir: &Path, subdirectory: &Path) -> Result<Self> {
        let dir = log_dir.join(subdirectory);
        fs::create_dir_all(&dir)?;
        let path = dir.join(SUMMARY_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    /// Log a scalar at `step`.
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let event = ScalarEvent {
            step,
            tag: tag.to_string(),
            value: value.is_finite().then_some(value),
            wall_time: Utc::now().timestamp_millis() as f64 / 1000.0,
        };
        writeln!(self.out, "{}", serde_json::to_string(&event)?)?;
        Ok(())
    }

    /// Flush buffered events to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Path of the summary file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SummaryWriter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

/// Read every event of a summary file.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarEvent>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| Ok(serde_json::from_str(l)?))
        .collect()
}
