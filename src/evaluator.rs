//! Inference-only evaluation against the baseline predictor.
//!
//! Every test sample is scored by the sum of absolute differences of each
//! branch's reconstruction. The cheapest branch is the network's candidate;
//! the sample switches to it only if it strictly beats the baseline cost.

use std::collections::BTreeMap;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::config::CompeteConfig;
use crate::dataset::{read_combined_testdata, BlockSamples, CombinedSplit};
use crate::error::{CompeteError, Result};
use crate::model::{CompetitionCnn, LossKind};
use crate::results::{save_results, CategoryResult, ResultsReport};
use crate::session::{CancellationToken, Session};

/// Which predictor a sample is coded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchDecision {
    /// Network branch `branch` beats the baseline.
    Network {
        /// Winning branch index.
        branch: usize,
    },
    /// The baseline is at least as cheap.
    Baseline,
}

/// Pick the cheaper predictor; ties and NaN costs go to the baseline.
pub fn decide(nn_cost: f32, branch: usize, baseline_cost: f32) -> SwitchDecision {
    if nn_cost < baseline_cost {
        SwitchDecision::Network { branch }
    } else {
        SwitchDecision::Baseline
    }
}

/// Costs and decision for one test sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    /// Cost of the best branch.
    pub nn_cost: f32,
    /// Baseline cost.
    pub baseline_cost: f32,
    /// Chosen predictor.
    pub decision: SwitchDecision,
}

impl SampleOutcome {
    /// Score a sample from its per-branch costs. The first minimum wins.
    pub fn from_costs(branch_costs: &[f32], baseline_cost: f32) -> Self {
        let (branch, nn_cost) = best_branch(branch_costs);
        Self {
            nn_cost,
            baseline_cost,
            decision: decide(nn_cost, branch, baseline_cost),
        }
    }

    /// Cost of the chosen predictor.
    pub fn switch_cost(&self) -> f32 {
        match self.decision {
            SwitchDecision::Network { .. } => self.nn_cost,
            SwitchDecision::Baseline => self.baseline_cost,
        }
    }

    /// Whether the network was chosen.
    pub fn uses_network(&self) -> bool {
        matches!(self.decision, SwitchDecision::Network { .. })
    }
}

fn best_branch(costs: &[f32]) -> (usize, f32) {
    costs
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, c)| !c.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, c)| match best {
            Some((_, b)) if b <= c => best,
            _ => Some((i, c)),
        })
        .unwrap_or((0, f32::NAN))
}

/// Per-sample outcomes and mean costs of one block category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryReport {
    /// Outcome of every sample, in dataset order.
    pub samples: Vec<SampleOutcome>,
}

impl CategoryReport {
    fn mean(&self, f: impl Fn(&SampleOutcome) -> f32) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().map(|s| f(s) as f64).sum::<f64>() / self.samples.len() as f64
    }

    /// Mean cost of the best branch.
    pub fn nn_cost(&self) -> f64 {
        self.mean(|s| s.nn_cost)
    }

    /// Mean baseline cost.
    pub fn baseline_cost(&self) -> f64 {
        self.mean(|s| s.baseline_cost)
    }

    /// Mean cost after per-sample switching.
    pub fn switch_cost(&self) -> f64 {
        self.mean(SampleOutcome::switch_cost)
    }

    /// Share of samples coded with the network.
    pub fn network_share(&self) -> f64 {
        self.mean(|s| if s.uses_network() { 1.0 } else { 0.0 })
    }

    /// Aggregate for the results file.
    pub fn to_result(&self) -> CategoryResult {
        CategoryResult {
            samples: self.samples.len(),
            nn_cost: self.nn_cost(),
            baseline_cost: self.baseline_cost(),
            switch_cost: self.switch_cost(),
            nn_selected: self.network_share(),
        }
    }
}

/// Runs the network over test data without gradients.
pub struct Evaluator<'a> {
    model: &'a CompetitionCnn,
    batch_size: usize,
    cancel: CancellationToken,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator for `model`.
    pub fn new(model: &'a CompetitionCnn, batch_size: usize) -> Self {
        Self {
            model,
            batch_size,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop between batches once `cancel` is set.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Score every sample of one category.
    pub fn evaluate_block(&self, samples: &BlockSamples) -> Result<CategoryReport> {
        let mut outcomes = Vec::with_capacity(samples.len());
        let mut idx = 0;
        while let Some(batch) = samples.batch(idx, self.batch_size)? {
            if self.cancel.is_cancelled() {
                return Err(CompeteError::training("evaluation cancelled"));
            }
            let costs = self
                .model
                .branch_losses(&batch, LossKind::Sad)?
                .detach()
                .to_vec2::<f32>()?;
            let baseline = batch.baseline.to_vec1::<f32>()?;
            outcomes.extend(
                costs
                    .iter()
                    .zip(baseline)
                    .map(|(branch_costs, base)| SampleOutcome::from_costs(branch_costs, base)),
            );
            idx += 1;
        }
        Ok(CategoryReport { samples: outcomes })
    }

    /// Score every category.
    pub fn evaluate(&self, test: &CombinedSplit) -> Result<BTreeMap<String, CategoryReport>> {
        let total: usize = test.values().map(|s| s.num_batches(self.batch_size)).sum();
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );

        let mut reports = BTreeMap::new();
        for (category, samples) in test {
            pb.set_message(format!("testing {category}"));
            let report = self.evaluate_block(samples)?;
            pb.inc(samples.num_batches(self.batch_size) as u64);
            reports.insert(category.clone(), report);
        }
        pb.finish_with_message("test complete");
        Ok(reports)
    }
}

/// Restore the trained model of `config` and write its test results.
///
/// # Errors
///
/// Returns [`CompeteError::ModelLoad`] when no checkpoint with a non-zero
/// global step exists.
pub fn run_test(config: &CompeteConfig, session: &Session) -> Result<ResultsReport> {
    run_test_with_cancellation(config, session, CancellationToken::new())
}

/// [`run_test`] with an external cancellation token.
pub fn run_test_with_cancellation(
    config: &CompeteConfig,
    session: &Session,
    cancel: CancellationToken,
) -> Result<ResultsReport> {
    let subdirectory = config.subdirectory();
    let model = CompetitionCnn::new(&config.model, session.var_builder())?;

    let mut store = CheckpointStore::new(&config.checkpoint_dir, session.var_map().clone());
    let global_step = if store.has_checkpoint(&subdirectory) {
        store.load(&subdirectory)?
    } else {
        0
    };
    if global_step == 0 {
        return Err(CompeteError::ModelLoad(format!(
            "no trained checkpoint in {}",
            store.run_dir(&subdirectory).display()
        )));
    }
    tracing::info!("Testing model trained for {} steps", global_step);

    let test = read_combined_testdata(&config.test_dataset_dir, session.device())?;
    let reports = Evaluator::new(&model, config.batch_size)
        .with_cancellation(cancel)
        .evaluate(&test)?;

    let categories = reports
        .iter()
        .map(|(category, report)| (category.clone(), report.to_result()))
        .collect();
    let report = ResultsReport::new(&config.model_name, &subdirectory, categories);
    save_results(&config.results_dir, &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_loses_to_cheaper_baseline() {
        let outcome = SampleOutcome::from_costs(&[0.3, 0.5], 0.2);
        assert_eq!(outcome.decision, SwitchDecision::Baseline);
        assert_eq!(outcome.switch_cost(), 0.2);
    }

    #[test]
    fn test_network_wins_with_best_branch() {
        let outcome = SampleOutcome::from_costs(&[0.4, 0.1, 0.1], 0.2);
        assert_eq!(outcome.decision, SwitchDecision::Network { branch: 1 });
        assert_eq!(outcome.switch_cost(), 0.1);
    }

    #[test]
    fn test_tie_goes_to_baseline() {
        assert_eq!(decide(0.2, 0, 0.2), SwitchDecision::Baseline);
        assert_eq!(decide(f32::NAN, 0, 0.2), SwitchDecision::Baseline);
    }

    #[test]
    fn test_nan_branch_is_ignored() {
        let outcome = SampleOutcome::from_costs(&[f32::NAN, 0.1], 0.2);
        assert_eq!(outcome.decision, SwitchDecision::Network { branch: 1 });
    }

    #[test]
    fn test_category_means() {
        let report = CategoryReport {
            samples: vec![
                SampleOutcome::from_costs(&[0.3], 0.2),
                SampleOutcome::from_costs(&[0.1], 0.2),
            ],
        };
        assert!((report.nn_cost() - 0.2).abs() < 1e-6);
        assert!((report.baseline_cost() - 0.2).abs() < 1e-6);
        assert!((report.switch_cost() - 0.15).abs() < 1e-6);
        assert_eq!(report.network_share(), 0.5);
    }

    #[test]
    fn test_run_test_requires_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = CompeteConfig {
            checkpoint_dir: dir.path().join("ckpt"),
            test_dataset_dir: dir.path().join("test"),
            ..Default::default()
        };
        let result = run_test(&config, &Session::cpu());
        assert!(matches!(result, Err(CompeteError::ModelLoad(_))));
    }
}
