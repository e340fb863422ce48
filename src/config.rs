//! Configuration parsing and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompeteError, Result};
use crate::model::LossKind;

/// Main configuration for a competition training/testing run.
///
/// # Example
///
/// ```rust
/// use compete_cnn_rs::CompeteConfig;
///
/// let yaml = r#"
/// model_name: competition
/// dataset_dir: ./data/luma_dataset
/// learning_rate: 0.0001
/// gradient_clip: 1.0
/// loss: sad
/// "#;
///
/// let config: CompeteConfig = serde_yaml::from_str(yaml).unwrap();
/// config.validate().unwrap();
/// assert_eq!(config.model.branches, 15);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompeteConfig {
    /// Model name, also the first component of the run subdirectory.
    pub model_name: String,

    /// Directory holding the `train/` and `val/` splits.
    pub dataset_dir: PathBuf,

    /// Directory holding the test split.
    #[serde(default = "default_test_dataset_dir")]
    pub test_dataset_dir: PathBuf,

    /// Samples per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of epochs.
    #[serde(default = "default_epoch")]
    pub epoch: usize,

    /// Early-stopping patience, in consecutive non-improving epochs.
    #[serde(default = "default_early_stopping")]
    pub early_stopping: usize,

    /// Adam learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Maximum global gradient norm.
    #[serde(default = "default_gradient_clip")]
    pub gradient_clip: f64,

    /// Per-branch loss function.
    ///
    /// Compete compares this loss with the stored baseline cost, which is a
    /// SAD. Any other loss only makes sense if the baseline was written in
    /// the same unit.
    #[serde(default)]
    pub loss: LossKind,

    /// Directory for test results.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Directory for model checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Directory for scalar summaries.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Network shape.
    #[serde(default)]
    pub model: ModelConfig,
}

fn default_test_dataset_dir() -> PathBuf {
    "./data/test_dataset".into()
}
fn default_batch_size() -> usize {
    32
}
fn default_epoch() -> usize {
    200
}
fn default_early_stopping() -> usize {
    10
}
fn default_lr() -> f64 {
    1e-4
}
fn default_gradient_clip() -> f64 {
    1.0
}
fn default_results_dir() -> PathBuf {
    "./results".into()
}
fn default_checkpoint_dir() -> PathBuf {
    "./checkpoints".into()
}
fn default_log_dir() -> PathBuf {
    "./logs".into()
}

/// Shape of the three-layer branch predictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of output branches.
    #[serde(default = "default_branches")]
    pub branches: usize,

    /// Output channels of the two hidden convolutions.
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: [usize; 2],

    /// Kernel sizes of the three convolutions (odd, unpadded).
    #[serde(default = "default_kernel_sizes")]
    pub kernel_sizes: [usize; 3],

    /// The network predicts a residual on top of the cropped input.
    #[serde(default = "default_true")]
    pub residual: bool,
}

fn default_branches() -> usize {
    15
}
fn default_hidden_channels() -> [usize; 2] {
    [64, 32]
}
fn default_kernel_sizes() -> [usize; 3] {
    [9, 1, 5]
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            branches: default_branches(),
            hidden_channels: default_hidden_channels(),
            kernel_sizes: default_kernel_sizes(),
            residual: true,
        }
    }
}

impl ModelConfig {
    /// Border, in pixels, consumed on each side by the unpadded convolutions.
    pub fn half_kernel(&self) -> usize {
        self.kernel_sizes.iter().map(|k| k.saturating_sub(1) / 2).sum()
    }
}

impl Default for CompeteConfig {
    fn default() -> Self {
        Self {
            model_name: "competition".into(),
            dataset_dir: "./data/train_dataset".into(),
            test_dataset_dir: default_test_dataset_dir(),
            batch_size: default_batch_size(),
            epoch: default_epoch(),
            early_stopping: default_early_stopping(),
            learning_rate: default_lr(),
            gradient_clip: default_gradient_clip(),
            loss: LossKind::default(),
            results_dir: default_results_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            log_dir: default_log_dir(),
            model: ModelConfig::default(),
        }
    }
}

impl CompeteConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CompeteError::Config`] naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(CompeteError::Config("model_name cannot be empty".into()));
        }
        if self.dataset_dir.as_os_str().is_empty() {
            return Err(CompeteError::Config("dataset_dir cannot be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(CompeteError::Config("batch_size must be > 0".into()));
        }
        if self.epoch == 0 {
            return Err(CompeteError::Config("epoch must be > 0".into()));
        }
        if self.early_stopping == 0 {
            return Err(CompeteError::Config("early_stopping must be > 0".into()));
        }
        if self.learning_rate.is_nan() || self.learning_rate <= 0.0 {
            return Err(CompeteError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.gradient_clip.is_nan() || self.gradient_clip <= 0.0 {
            return Err(CompeteError::Config(format!(
                "gradient_clip must be positive, got {}",
                self.gradient_clip
            )));
        }
        if self.model.branches == 0 {
            return Err(CompeteError::Config("model.branches must be > 0".into()));
        }
        if self.model.hidden_channels.contains(&0) {
            return Err(CompeteError::Config(
                "model.hidden_channels must be > 0".into(),
            ));
        }
        if let Some(k) = self.model.kernel_sizes.iter().find(|k| **k % 2 == 0) {
            return Err(CompeteError::Config(format!(
                "model.kernel_sizes must be odd, got {k}"
            )));
        }
        Ok(())
    }

    /// Run subdirectory: `<model_name>/<last component of dataset_dir>`.
    ///
    /// Checkpoints, summaries and results of one run all live under it.
    pub fn subdirectory(&self) -> PathBuf {
        let dataset = self.dataset_dir.file_name().unwrap_or_default();
        Path::new(&self.model_name).join(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CompeteConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.branches, 15);
        assert_eq!(config.model.half_kernel(), 6);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = "model_name: cnn\ndataset_dir: data/set_a\n";
        let config: CompeteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.loss, LossKind::Sad);
        assert!(config.model.residual);
    }

    #[test]
    fn test_loss_selector_parses() {
        let yaml = "model_name: cnn\ndataset_dir: data/set_a\nloss: mse\n";
        let config: CompeteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.loss, LossKind::Mse);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let config = CompeteConfig {
            batch_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_rejects_zero_patience() {
        let config = CompeteConfig {
            early_stopping: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_nan_learning_rate() {
        let config = CompeteConfig {
            learning_rate: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_even_kernel() {
        let mut config = CompeteConfig::default();
        config.model.kernel_sizes = [9, 2, 5];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("odd"));
    }

    #[test]
    fn test_subdirectory_uses_dataset_leaf() {
        let config = CompeteConfig {
            model_name: "competition".into(),
            dataset_dir: "data/luma_4x4/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.subdirectory(),
            PathBuf::from("competition").join("luma_4x4")
        );
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = CompeteConfig::default();
        config.model.branches = 3;
        config.to_file(&path).unwrap();

        let loaded = CompeteConfig::from_file(&path).unwrap();
        assert_eq!(loaded.model, config.model);
        assert_eq!(loaded.model_name, config.model_name);
    }
}
