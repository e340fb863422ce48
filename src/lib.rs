//! # compete-cnn-rs
//!
//! A multi-branch convolutional predictor trained to compete against a
//! baseline predictor, block by block.
//!
//! The network emits several candidate predictions (branches) per block.
//! Training follows a three-phase curriculum:
//!
//! 1. **Warmup** (epoch 0): every branch learns from every sample.
//! 2. **Targeted** (epoch 1): branch `i` learns from fractional subset `i`.
//! 3. **Compete** (epoch 2 onwards): each sample trains only its best
//!    branch, and only when that branch beats the baseline cost.
//!
//! At test time every sample is coded with whichever of the best branch and
//! the baseline is cheaper; the evaluator reports the network, baseline and
//! switched costs per block category.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! compete-cnn init config.yaml
//! compete-cnn validate config.yaml
//! compete-cnn train config.yaml
//! compete-cnn test config.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use compete_cnn_rs::{run_test, CompeteConfig, Session, Trainer};
//!
//! # fn main() -> compete_cnn_rs::Result<()> {
//! let config = CompeteConfig::from_file("config.yaml")?;
//!
//! let mut trainer = Trainer::new(config.clone(), Session::from_env())?;
//! let report = trainer.train()?;
//! println!("stopped: {:?}", report.stop_reason);
//!
//! let results = run_test(&config, trainer.session())?;
//! println!("switch cost: {:.4}", results.total.switch_cost);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod competition;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod optimizer;
pub mod results;
pub mod session;
pub mod summary;
pub mod trainer;

pub use checkpoint::{CheckpointStore, EpochRecord};
pub use competition::{competition_loss, TrainingPhase};
pub use config::{CompeteConfig, ModelConfig};
pub use dataset::{
    calculate_batch_number, read_combined_data, read_combined_testdata, read_shared_data,
    BlockSamples, SharedData,
};
pub use error::{CompeteError, Result};
pub use evaluator::{run_test, Evaluator, SwitchDecision};
pub use model::{CompetitionCnn, LossKind};
pub use results::{save_results, ResultsReport};
pub use session::{CancellationToken, Session};
pub use trainer::{StopReason, Trainer, TrainingReport};
