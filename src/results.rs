//! Test results report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CompeteError, Result};

const RESULTS_FILE: &str = "results.json";

/// Costs of one block category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResult {
    /// Number of test samples.
    pub samples: usize,
    /// Mean cost of the best network branch.
    pub nn_cost: f64,
    /// Mean baseline cost.
    pub baseline_cost: f64,
    /// Mean cost when the cheaper of the two is picked per sample.
    pub switch_cost: f64,
    /// Share of samples where the network was picked.
    pub nn_selected: f64,
}

/// Everything written to `results.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsReport {
    /// Model name.
    pub model_name: String,
    /// Run subdirectory.
    pub subdirectory: PathBuf,
    /// Per-category costs.
    pub categories: BTreeMap<String, CategoryResult>,
    /// Sample-weighted mean over all categories.
    pub total: CategoryResult,
    /// When the report was written.
    pub created_at: DateTime<Utc>,
}

impl ResultsReport {
    /// Build a report, computing the sample-weighted totals.
    pub fn new(
        model_name: &str,
        subdirectory: &Path,
        categories: BTreeMap<String, CategoryResult>,
    ) -> Self {
        let samples: usize = categories.values().map(|c| c.samples).sum();
        let weighted = |f: fn(&CategoryResult) -> f64| {
            if samples == 0 {
                return f64::NAN;
            }
            categories
                .values()
                .map(|c| f(c) * c.samples as f64)
                .sum::<f64>()
                / samples as f64
        };
        let total = CategoryResult {
            samples,
            nn_cost: weighted(|c| c.nn_cost),
            baseline_cost: weighted(|c| c.baseline_cost),
            switch_cost: weighted(|c| c.switch_cost),
            nn_selected: weighted(|c| c.nn_selected),
        };
        Self {
            model_name: model_name.to_string(),
            subdirectory: subdirectory.to_path_buf(),
            categories,
            total,
            created_at: Utc::now(),
        }
    }
}

/// Write the report to `<results_dir>/<subdirectory>/results.json`.
///
/// Returns the path written.
pub fn save_results(results_dir: &Path, report: &ResultsReport) -> Result<PathBuf> {
    if report.categories.is_empty() {
        return Err(CompeteError::dataset("no test categories to report"));
    }
    let dir = results_dir.join(&report.subdirectory);
    fs::create_dir_all(&dir)?;
    let path = dir.join(RESULTS_FILE);
    fs::write(&path, serde_json::to_string_pretty(report)?)?;

    for (category, r) in &report.categories {
        tracing::info!(
            "{}: nn {:.4} baseline {:.4} switch {:.4} ({:.1}% network)",
            category,
            r.nn_cost,
            r.baseline_cost,
            r.switch_cost,
            r.nn_selected * 100.0
        );
    }
    tracing::info!("Results written to {}", path.display());
    Ok(path)
}

/// Read a report back.
pub fn load_results(path: &Path) -> Result<ResultsReport> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}
