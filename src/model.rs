//! Multi-branch convolutional predictor.
//!
//! Three unpadded convolutions map an input block with a border of
//! `half_kernel` pixels to `branches` candidate predictions of the inner
//! block:
//!
//! - `conv1`: k0 x k0, 1 -> hidden[0], ReLU
//! - `conv2`: k1 x k1, hidden[0] -> hidden[1], ReLU
//! - `conv3`: k2 x k2, hidden[1] -> branches, linear
//!
//! With `residual` enabled the branch outputs are residuals and the cropped
//! input is added back before any cost is measured.

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::dataset::Batch;

/// Per-branch loss function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// Mean squared error over the block.
    Mse,
    /// Mean absolute error over the block.
    Mae,
    /// Sum of absolute differences over the block.
    #[default]
    Sad,
}

impl LossKind {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Mse => "mse",
            LossKind::Mae => "mae",
            LossKind::Sad => "sad",
        }
    }

    /// Loss of every branch for every sample.
    ///
    /// `predictions` is `[batch, branches, h, w]`, `labels` is
    /// `[batch, 1, h, w]`. Returns `[batch, branches]`.
    pub fn branch_losses(&self, predictions: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let diff = predictions.broadcast_sub(labels)?;
        let err = match self {
            LossKind::Mse => diff.sqr()?,
            LossKind::Mae | LossKind::Sad => diff.abs()?,
        };
        let per_pixel = err.flatten_from(2)?;
        match self {
            LossKind::Sad => per_pixel.sum(2),
            LossKind::Mse | LossKind::Mae => per_pixel.mean(2),
        }
    }
}

/// The branch predictor.
pub struct CompetitionCnn {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    half_kernel: usize,
    branches: usize,
    residual: bool,
}

impl CompetitionCnn {
    /// Build the network, registering its variables through `vb`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let [k1, k2, k3] = config.kernel_sizes;
        let [c1, c2] = config.hidden_channels;
        let cfg = Conv2dConfig::default();

        let conv1 = conv2d(1, c1, k1, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(c1, c2, k2, cfg, vb.pp("conv2"))?;
        let conv3 = conv2d(c2, config.branches, k3, cfg, vb.pp("conv3"))?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            half_kernel: config.half_kernel(),
            branches: config.branches,
            residual: config.residual,
        })
    }

    /// Number of output branches.
    pub fn branches(&self) -> usize {
        self.branches
    }

    /// Border consumed on each side of the input.
    pub fn half_kernel(&self) -> usize {
        self.half_kernel
    }

    /// Whether outputs are residuals over the cropped input.
    pub fn is_residual(&self) -> bool {
        self.residual
    }

    /// Inner block of the input, `[batch, 1, h, w]`.
    pub fn crop_input(&self, inputs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = inputs.dims4()?;
        let hk = self.half_kernel;
        if h <= 2 * hk || w <= 2 * hk {
            candle_core::bail!(
                "input block {h}x{w} is too small for a border of {hk} pixels"
            );
        }
        inputs.narrow(2, hk, h - 2 * hk)?.narrow(3, hk, w - 2 * hk)
    }

    /// Full-resolution prediction of every branch, `[batch, branches, h, w]`.
    pub fn reconstruct(&self, inputs: &Tensor) -> Result<Tensor> {
        let out = self.forward(inputs)?;
        if self.residual {
            out.broadcast_add(&self.crop_input(inputs)?)
        } else {
            Ok(out)
        }
    }

    /// Per-branch losses for a batch, `[batch, branches]`.
    pub fn branch_losses(&self, batch: &Batch, loss: LossKind) -> Result<Tensor> {
        let predictions = self.reconstruct(&batch.inputs)?;
        loss.branch_losses(&predictions, &batch.labels)
    }
}

impl Module for CompetitionCnn {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        self.conv3.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    use crate::session::Session;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            branches: 3,
            hidden_channels: [4, 4],
            kernel_sizes: [3, 1, 3],
            residual: true,
        }
    }

    #[test]
    fn test_output_shape() {
        let session = Session::cpu();
        let model = CompetitionCnn::new(&tiny_config(), session.var_builder()).unwrap();
        assert_eq!(model.half_kernel(), 2);

        let inputs = Tensor::rand(0f32, 1f32, (2, 1, 8, 8), &Device::Cpu).unwrap();
        let out = model.reconstruct(&inputs).unwrap();
        assert_eq!(out.dims(), &[2, 3, 4, 4]);
    }

    #[test]
    fn test_crop_input_takes_inner_block() {
        let session = Session::cpu();
        let model = CompetitionCnn::new(&tiny_config(), session.var_builder()).unwrap();

        let data: Vec<f32> = (0..36).map(|v| v as f32).collect();
        let inputs = Tensor::from_vec(data, (1, 1, 6, 6), &Device::Cpu).unwrap();
        let cropped = model.crop_input(&inputs).unwrap();
        assert_eq!(cropped.dims(), &[1, 1, 2, 2]);
        let values = cropped.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![14.0, 15.0, 20.0, 21.0]);
    }

    #[test]
    fn test_crop_rejects_small_input() {
        let session = Session::cpu();
        let model = CompetitionCnn::new(&tiny_config(), session.var_builder()).unwrap();
        let inputs = Tensor::zeros((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(model.crop_input(&inputs).is_err());
    }

    #[test]
    fn test_branch_losses_per_kind() {
        let device = Device::Cpu;
        // two branches over a 1x2 block, label is zero
        let preds = Tensor::from_vec(vec![1f32, -1., 2., 2.], (1, 2, 1, 2), &device).unwrap();
        let labels = Tensor::zeros((1, 1, 1, 2), DType::F32, &device).unwrap();

        let mse = LossKind::Mse.branch_losses(&preds, &labels).unwrap();
        assert_eq!(mse.to_vec2::<f32>().unwrap(), vec![vec![1.0, 4.0]]);

        let mae = LossKind::Mae.branch_losses(&preds, &labels).unwrap();
        assert_eq!(mae.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0]]);

        let sad = LossKind::Sad.branch_losses(&preds, &labels).unwrap();
        assert_eq!(sad.to_vec2::<f32>().unwrap(), vec![vec![2.0, 4.0]]);
    }

    #[test]
    fn test_non_residual_skips_crop() {
        let session = Session::cpu();
        let config = ModelConfig {
            residual: false,
            ..tiny_config()
        };
        let model = CompetitionCnn::new(&config, session.var_builder()).unwrap();
        let inputs = Tensor::rand(0f32, 1f32, (1, 1, 8, 8), &Device::Cpu).unwrap();

        let raw = model.forward(&inputs).unwrap();
        let recon = model.reconstruct(&inputs).unwrap();
        let diff: f32 = (raw - recon)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }
}
