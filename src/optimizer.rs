//! Adam with global-norm gradient clipping.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{CompeteError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
    /// Maximum global gradient norm
    pub gradient_clip: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            gradient_clip: 1.0,
        }
    }
}

impl OptimizerConfig {
    /// Build the optimizer over every variable currently in `var_map`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, var_map: &VarMap) -> Result<ClippedAdam> {
        let vars = var_map.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        };

        let inner = candle_nn::AdamW::new(vars.clone(), params)
            .map_err(|e| CompeteError::training(format!("Failed to create Adam: {e}")))?;

        Ok(ClippedAdam {
            inner,
            vars,
            max_norm: self.gradient_clip,
        })
    }
}

/// Adam whose gradients are rescaled to a maximum global L2 norm.
pub struct ClippedAdam {
    inner: candle_nn::AdamW,
    vars: Vec<Var>,
    max_norm: f64,
}

impl ClippedAdam {
    /// Backpropagate `loss`, clip and apply one update.
    ///
    /// Returns the global gradient norm before clipping.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<f64> {
        let mut grads = loss.backward()?;
        let norm = clip_by_global_norm(&mut grads, &self.vars, self.max_norm)?;
        self.inner.step(&grads)?;
        Ok(norm)
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Clipping threshold.
    pub fn max_norm(&self) -> f64 {
        self.max_norm
    }
}

/// Scale the gradients of `vars` by `max_norm / max(norm, max_norm)`.
///
/// Returns the global norm before scaling. Variables without a gradient are
/// ignored.
pub fn clip_by_global_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?;
            sum_sq += sq.to_scalar::<f64>()?;
        }
    }
    let norm = sum_sq.sqrt();

    if norm > max_norm {
        let scale = max_norm / norm;
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), grad.affine(scale, 0.)?);
            }
        }
    }
    Ok(norm)
}
