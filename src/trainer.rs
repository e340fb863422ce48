//! Three-phase training loop.
//!
//! Each epoch runs the phase given by [`TrainingPhase::from_epoch`]:
//!
//! - warmup and targeted epochs walk every category, then every batch index
//!   below the category's nested batch count (that of its largest subset),
//!   then every fractional subset that still has a batch at that index,
//!   taking one optimizer step per batch;
//! - compete epochs walk the combined data of every category and skip the
//!   batches whose competition loss is the NaN sentinel.
//!
//! After each epoch the validation error is handed to the
//! [`CheckpointStore`], which writes a checkpoint on improvement and returns
//! the early-stop counter.

use std::collections::BTreeMap;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointStore;
use crate::competition::{competition_loss, is_skip, TrainingPhase};
use crate::config::CompeteConfig;
use crate::dataset::{
    calculate_batch_number, read_combined_data, read_shared_data, Batch,
    CombinedData, CombinedSplit, SharedData, SharedSplit,
};
use crate::error::{CompeteError, Result};
use crate::model::CompetitionCnn;
use crate::optimizer::{ClippedAdam, OptimizerConfig};
use crate::session::{CancellationToken, Session};
use crate::summary::SummaryWriter;

/// Why training ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured number of epochs ran.
    MaxEpochs,
    /// Validation error stopped improving.
    EarlyStopping {
        /// Last epoch that ran.
        epoch: usize,
    },
    /// The cancellation token was set.
    Cancelled,
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochOutcome {
    /// Zero-based epoch.
    pub epoch: usize,
    /// Phase the epoch ran in.
    pub phase: TrainingPhase,
    /// Loss of the last optimizer step, if any ran.
    pub train_error: Option<f64>,
    /// Mean validation error.
    pub val_error: f64,
    /// Optimizer steps taken.
    pub steps: u64,
    /// Training batches skipped by the competition mask.
    pub skipped_batches: usize,
    /// Validation batches skipped by the competition mask.
    pub skipped_val_batches: usize,
    /// Consecutive non-improving epochs after this one.
    pub early_stop_counter: usize,
}

/// Summary of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// First epoch that ran.
    pub start_epoch: usize,
    /// Global step restored from the checkpoint (0 for a fresh run).
    pub resumed_global_step: u64,
    /// Global step at the end of the run.
    pub final_global_step: u64,
    /// Optimizer steps of one warmup or targeted epoch.
    pub steps_per_epoch: u64,
    /// Finished epochs, in order.
    pub epochs: Vec<EpochOutcome>,
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Best validation error known to the checkpoint store.
    pub best_val_error: Option<f64>,
}

#[derive(Debug, Default)]
struct PassStats {
    last_loss: Option<f64>,
    steps: u64,
    skipped: usize,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct ValStats {
    sum: f64,
    batches: usize,
    skipped: usize,
    cancelled: bool,
}

struct BatchCounts {
    nested_train: BTreeMap<String, usize>,
    nested_val: BTreeMap<String, usize>,
    combined_train: BTreeMap<String, usize>,
    combined_val: BTreeMap<String, usize>,
}

/// Drives the curriculum over a [`Session`]'s parameters.
pub struct Trainer {
    config: CompeteConfig,
    session: Session,
    model: CompetitionCnn,
    optimizer: ClippedAdam,
    checkpoints: CheckpointStore,
    global_step: u64,
    cancel: CancellationToken,
}

impl Trainer {
    /// Build the model and optimizer inside `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the model cannot
    /// be built.
    pub fn new(config: CompeteConfig, session: Session) -> Result<Self> {
        config.validate()?;

        let model = CompetitionCnn::new(&config.model, session.var_builder())?;
        let optimizer = OptimizerConfig {
            learning_rate: config.learning_rate,
            gradient_clip: config.gradient_clip,
            ..OptimizerConfig::default()
        }
        .build(session.var_map())?;
        tracing::info!(
            "Initialized {}-branch network with {} parameters (lr={}, clip={})",
            model.branches(),
            session.parameter_count(),
            optimizer.learning_rate(),
            optimizer.max_norm()
        );

        let checkpoints = CheckpointStore::new(&config.checkpoint_dir, session.var_map().clone());

        Ok(Self {
            config,
            session,
            model,
            optimizer,
            checkpoints,
            global_step: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop between batches once `cancel` is set.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Read the configured dataset and train on it.
    pub fn train(&mut self) -> Result<TrainingReport> {
        let shared = read_shared_data(
            &self.config.dataset_dir,
            self.config.batch_size,
            self.session.device(),
        )?;
        self.train_on(&shared)
    }

    /// Train on already loaded data, resuming from the run's checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`CompeteError::EmptyValidation`] when every validation batch
    /// of an epoch is skipped; the checkpoint of the last improving epoch is
    /// left in place.
    pub fn train_on(&mut self, shared: &SharedData) -> Result<TrainingReport> {
        let branches = self.model.branches();
        for (category, subsets) in shared.train.iter().chain(&shared.val) {
            if subsets.len() > branches {
                return Err(CompeteError::dataset(format!(
                    "category {category} has {} subsets but the network has {branches} branches",
                    subsets.len()
                )));
            }
        }

        let combined = read_combined_data(shared)?;
        let bs = self.config.batch_size;
        let (nested_train, nested_val) = calculate_batch_number(&shared.train, &shared.val, bs);
        let (combined_train, combined_val) =
            calculate_batch_number(&combined.train, &combined.val, bs);
        let counts = BatchCounts {
            nested_train,
            nested_val,
            combined_train,
            combined_val,
        };

        let per_epoch = steps_per_epoch(&shared.train, bs);
        let subdirectory = self.config.subdirectory();
        let resumed = self.checkpoints.load(&subdirectory)?;
        self.global_step = resumed;
        let start_epoch = resume_epoch(resumed, per_epoch);

        tracing::info!("Starting training");
        tracing::info!("  Model: {}", self.config.model_name);
        tracing::info!("  Loss: {}", self.config.loss.name());
        tracing::info!("  Epochs: {} (starting at {})", self.config.epoch, start_epoch);
        tracing::info!("  Steps per warmup/targeted epoch: {}", per_epoch);

        let mut summary = SummaryWriter::create(&self.config.log_dir, &subdirectory)?;
        let mut epochs = Vec::new();
        let mut stop_reason = StopReason::MaxEpochs;

        for epoch in start_epoch..self.config.epoch {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            let phase = TrainingPhase::from_epoch(epoch);
            let started = Instant::now();

            let total = if phase.iterates_subsets() {
                per_epoch
            } else {
                counts.combined_train.values().sum::<usize>() as u64
            };
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                    .progress_chars("#>-"),
            );
            pb.set_message(format!("epoch {epoch} ({phase})"));

            let pass = if phase.iterates_subsets() {
                self.train_subsets(
                    phase,
                    &shared.train,
                    &counts.nested_train,
                    &pb,
                    &mut summary,
                )?
            } else {
                self.train_combined(&combined.train, &counts.combined_train, &pb, &mut summary)?
            };
            pb.finish_and_clear();
            if pass.cancelled {
                tracing::info!("Training cancelled during epoch {}", epoch);
                stop_reason = StopReason::Cancelled;
                break;
            }

            let val = self.validate(phase, shared, &combined, &counts)?;
            if val.cancelled {
                tracing::info!("Training cancelled during validation of epoch {}", epoch);
                stop_reason = StopReason::Cancelled;
                break;
            }
            if val.batches == 0 {
                return Err(CompeteError::EmptyValidation { epoch });
            }
            let val_error = val.sum / val.batches as f64;

            let counter = self.checkpoints.save(
                epoch,
                self.global_step,
                started.elapsed(),
                pass.last_loss,
                val_error,
                &subdirectory,
            )?;
            summary.add_scalar("val/error", val_error, self.global_step)?;
            summary.flush()?;

            tracing::info!(
                "Epoch {}/{} [{}]: train {} val {:.6} ({} steps, {} skipped, {} val skipped, patience {}/{})",
                epoch + 1,
                self.config.epoch,
                phase,
                pass.last_loss
                    .map_or_else(|| "n/a".to_string(), |l| format!("{l:.6}")),
                val_error,
                pass.steps,
                pass.skipped,
                val.skipped,
                counter,
                self.config.early_stopping
            );

            epochs.push(EpochOutcome {
                epoch,
                phase,
                train_error: pass.last_loss,
                val_error,
                steps: pass.steps,
                skipped_batches: pass.skipped,
                skipped_val_batches: val.skipped,
                early_stop_counter: counter,
            });

            if counter >= self.config.early_stopping {
                tracing::info!(
                    "Early stopping after epoch {}: no improvement for {} epochs",
                    epoch,
                    counter
                );
                stop_reason = StopReason::EarlyStopping { epoch };
                break;
            }
        }

        summary.flush()?;
        tracing::info!("Training finished: {:?}", stop_reason);

        Ok(TrainingReport {
            start_epoch,
            resumed_global_step: resumed,
            final_global_step: self.global_step,
            steps_per_epoch: per_epoch,
            epochs,
            stop_reason,
            best_val_error: self.checkpoints.best_val_error(),
        })
    }

    /// Optimizer steps taken so far, including restored ones.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// The network being trained.
    pub fn model(&self) -> &CompetitionCnn {
        &self.model
    }

    /// The session holding the parameters.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The configuration in use.
    pub fn config(&self) -> &CompeteConfig {
        &self.config
    }

    fn train_subsets(
        &mut self,
        phase: TrainingPhase,
        split: &SharedSplit,
        counts: &BTreeMap<String, usize>,
        pb: &ProgressBar,
        summary: &mut SummaryWriter,
    ) -> Result<PassStats> {
        let mut stats = PassStats::default();
        for (category, subsets) in split {
            let batches = counts.get(category).copied().unwrap_or(0);
            for idx in 0..batches {
                for (subset, samples) in subsets.values().enumerate() {
                    if self.cancel.is_cancelled() {
                        stats.cancelled = true;
                        return Ok(stats);
                    }
                    let Some(batch) = samples.batch(idx, self.config.batch_size)? else {
                        continue;
                    };
                    let loss = self.phase_loss(&batch, phase, subset)?;
                    if is_skip(&loss)? {
                        return Err(CompeteError::training(format!(
                            "NaN loss in {phase} epoch (category {category}, batch {idx}, subset {subset})"
                        )));
                    }
                    let value = self.step(&loss, summary)?;
                    stats.last_loss = Some(value);
                    stats.steps += 1;
                    pb.set_message(format!("{phase} loss {value:.4}"));
                    pb.inc(1);
                }
            }
        }
        Ok(stats)
    }

    fn train_combined(
        &mut self,
        split: &CombinedSplit,
        counts: &BTreeMap<String, usize>,
        pb: &ProgressBar,
        summary: &mut SummaryWriter,
    ) -> Result<PassStats> {
        let mut stats = PassStats::default();
        for (category, samples) in split {
            let batches = counts.get(category).copied().unwrap_or(0);
            for idx in 0..batches {
                if self.cancel.is_cancelled() {
                    stats.cancelled = true;
                    return Ok(stats);
                }
                let Some(batch) = samples.batch(idx, self.config.batch_size)? else {
                    continue;
                };
                let loss = self.phase_loss(&batch, TrainingPhase::Compete, 0)?;
                pb.inc(1);
                if is_skip(&loss)? {
                    tracing::debug!("Skipping batch {} of {}: baseline wins every sample", idx, category);
                    stats.skipped += 1;
                    continue;
                }
                let value = self.step(&loss, summary)?;
                stats.last_loss = Some(value);
                stats.steps += 1;
                pb.set_message(format!("compete loss {value:.4}"));
            }
        }
        Ok(stats)
    }

    fn validate(
        &self,
        phase: TrainingPhase,
        shared: &SharedData,
        combined: &CombinedData,
        counts: &BatchCounts,
    ) -> Result<ValStats> {
        let mut stats = ValStats::default();
        match phase {
            TrainingPhase::Warmup | TrainingPhase::Targeted => {
                for (category, subsets) in &shared.val {
                    let batches = counts.nested_val.get(category).copied().unwrap_or(0);
                    for idx in 0..batches {
                        for (subset, samples) in subsets.values().enumerate() {
                            if self.cancel.is_cancelled() {
                                stats.cancelled = true;
                                return Ok(stats);
                            }
                            if let Some(batch) = samples.batch(idx, self.config.batch_size)? {
                                self.accumulate(&mut stats, &batch, phase, subset)?;
                            }
                        }
                    }
                }
            }
            TrainingPhase::Compete => {
                for (category, samples) in &combined.val {
                    let batches = counts.combined_val.get(category).copied().unwrap_or(0);
                    for idx in 0..batches {
                        if self.cancel.is_cancelled() {
                            stats.cancelled = true;
                            return Ok(stats);
                        }
                        if let Some(batch) = samples.batch(idx, self.config.batch_size)? {
                            self.accumulate(&mut stats, &batch, phase, 0)?;
                        }
                    }
                }
            }
        }
        Ok(stats)
    }

    fn accumulate(
        &self,
        stats: &mut ValStats,
        batch: &Batch,
        phase: TrainingPhase,
        subset: usize,
    ) -> Result<()> {
        let loss = self.phase_loss(batch, phase, subset)?.detach();
        if is_skip(&loss)? {
            tracing::debug!("Skipping validation batch in {} phase", phase);
            stats.skipped += 1;
        } else {
            stats.sum += scalar(&loss)?;
            stats.batches += 1;
        }
        Ok(())
    }

    fn phase_loss(
        &self,
        batch: &Batch,
        phase: TrainingPhase,
        subset: usize,
    ) -> Result<candle_core::Tensor> {
        let losses = self.model.branch_losses(batch, self.config.loss)?;
        competition_loss(&losses, &batch.baseline, phase, subset)
    }

    fn step(&mut self, loss: &candle_core::Tensor, summary: &mut SummaryWriter) -> Result<f64> {
        let value = scalar(loss)?;
        let grad_norm = self.optimizer.backward_step(loss)?;
        self.global_step += 1;
        summary.add_scalar("train/loss", value, self.global_step)?;
        summary.add_scalar("train/grad_norm", grad_norm, self.global_step)?;
        Ok(value)
    }
}

fn scalar(loss: &candle_core::Tensor) -> Result<f64> {
    Ok(loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

/// Optimizer steps of one warmup or targeted epoch: every batch of every
/// subset of every category.
pub fn steps_per_epoch(train: &SharedSplit, batch_size: usize) -> u64 {
    train
        .values()
        .flat_map(|subsets| subsets.values())
        .map(|samples| samples.num_batches(batch_size) as u64)
        .sum()
}

/// Epoch to resume at after `global_step` restored steps.
pub fn resume_epoch(global_step: u64, steps_per_epoch: u64) -> usize {
    if steps_per_epoch == 0 {
        return 0;
    }
    (global_step / steps_per_epoch) as usize
}
