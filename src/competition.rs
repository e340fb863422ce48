//! Training phases and the per-phase reduction of branch losses.
//!
//! The network produces one loss per sample and branch. How that matrix is
//! reduced to the scalar the optimizer sees depends on the phase:
//!
//! | phase      | epochs | reduction                                        |
//! |------------|--------|--------------------------------------------------|
//! | `Warmup`   | 0      | mean over every sample and branch                |
//! | `Targeted` | 1      | mean of branch `i` (the subset index)            |
//! | `Compete`  | 2..    | per-sample best branch, kept only if it beats the baseline, then mean |
//!
//! In `Compete` an empty selection yields a NaN scalar; callers skip the
//! batch when [`is_skip`] reports it.

use std::fmt;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{CompeteError, Result};

/// Curriculum stage, derived from the epoch counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingPhase {
    /// Every branch learns from every sample.
    Warmup,
    /// Branch `i` learns from fractional subset `i`.
    Targeted,
    /// Only samples where the best branch beats the baseline contribute.
    Compete,
}

impl TrainingPhase {
    /// Phase for a zero-based epoch.
    pub fn from_epoch(epoch: usize) -> Self {
        match epoch {
            0 => TrainingPhase::Warmup,
            1 => TrainingPhase::Targeted,
            _ => TrainingPhase::Compete,
        }
    }

    /// Get phase name.
    pub fn name(&self) -> &'static str {
        match self {
            TrainingPhase::Warmup => "warmup",
            TrainingPhase::Targeted => "targeted",
            TrainingPhase::Compete => "compete",
        }
    }

    /// Whether the phase walks the fractional subsets of each category.
    pub fn iterates_subsets(&self) -> bool {
        !matches!(self, TrainingPhase::Compete)
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduce `[batch, branches]` losses to the scalar training loss.
///
/// `subset` is only read in [`TrainingPhase::Targeted`], where it selects
/// the branch. `baseline` is `[batch]` and only read in
/// [`TrainingPhase::Compete`].
pub fn competition_loss(
    branch_losses: &Tensor,
    baseline: &Tensor,
    phase: TrainingPhase,
    subset: usize,
) -> Result<Tensor> {
    let (batch, branches) = branch_losses.dims2()?;
    match phase {
        TrainingPhase::Warmup => Ok(branch_losses.mean_all()?),
        TrainingPhase::Targeted => {
            if subset >= branches {
                return Err(CompeteError::training(format!(
                    "subset index {subset} has no branch (network has {branches})"
                )));
            }
            Ok(branch_losses.narrow(1, subset, 1)?.mean_all()?)
        }
        TrainingPhase::Compete => {
            let baseline_len = baseline.dims1()?;
            if baseline_len != batch {
                return Err(CompeteError::training(format!(
                    "{batch} samples but {baseline_len} baseline costs"
                )));
            }
            let nn_losses = branch_losses.min(D::Minus1)?;
            let kept = retained_samples(
                &nn_losses.to_vec1::<f32>()?,
                &baseline.to_vec1::<f32>()?,
            );
            if kept.is_empty() {
                return Ok(Tensor::new(f32::NAN, branch_losses.device())?);
            }
            let index = Tensor::new(kept.as_slice(), branch_losses.device())?;
            Ok(nn_losses.index_select(&index, 0)?.mean_all()?)
        }
    }
}

/// Indices of samples whose network loss is strictly below the baseline.
///
/// Ties go to the baseline, and any NaN comparison drops the sample.
pub fn retained_samples(nn_losses: &[f32], baseline: &[f32]) -> Vec<u32> {
    nn_losses
        .iter()
        .zip(baseline)
        .enumerate()
        .filter(|(_, (nn, base))| nn < base)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Whether a scalar loss is the skip sentinel.
pub fn is_skip(loss: &Tensor) -> Result<bool> {
    let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    Ok(value.is_nan())
}
