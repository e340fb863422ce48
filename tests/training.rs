//! End-to-end training and testing on a tiny synthetic dataset.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use compete_cnn_rs::{
    run_test, BlockSamples, CancellationToken, CompeteConfig, CompeteError, ModelConfig,
    Session, StopReason, Trainer,
};
use tempfile::TempDir;

const SUBSETS: [&str; 3] = ["f0", "f1", "f2"];
const SAMPLES_PER_SUBSET: usize = 4;
const BATCH_SIZE: usize = 2;

fn block_samples(n: usize, baseline: f32) -> BlockSamples {
    let device = Device::Cpu;
    // 4x4 blocks with a 2 pixel border
    BlockSamples::new(
        Tensor::rand(0f32, 1f32, (n, 1, 8, 8), &device).unwrap(),
        Tensor::rand(0f32, 1f32, (n, 1, 4, 4), &device).unwrap(),
        Tensor::full(baseline, n, &device).unwrap(),
    )
    .unwrap()
}

fn write_dataset(root: &Path, baseline: f32) {
    for split in ["train", "val"] {
        let dir = root.join(split).join("4x4");
        std::fs::create_dir_all(&dir).unwrap();
        for subset in SUBSETS {
            block_samples(SAMPLES_PER_SUBSET, baseline)
                .save(&dir.join(format!("{subset}.safetensors")))
                .unwrap();
        }
    }
}

fn write_testset(root: &Path) {
    std::fs::create_dir_all(root).unwrap();
    block_samples(5, 1.0)
        .save(&root.join("4x4.safetensors"))
        .unwrap();
}

fn tiny_config(tmp: &TempDir, epochs: usize) -> CompeteConfig {
    let base = tmp.path();
    CompeteConfig {
        model_name: "cnn".into(),
        dataset_dir: base.join("luma"),
        test_dataset_dir: base.join("test"),
        batch_size: BATCH_SIZE,
        epoch: epochs,
        early_stopping: 10,
        learning_rate: 1e-3,
        gradient_clip: 1.0,
        results_dir: base.join("results"),
        checkpoint_dir: base.join("checkpoints"),
        log_dir: base.join("logs"),
        model: ModelConfig {
            branches: 3,
            hidden_channels: [4, 4],
            kernel_sizes: [3, 1, 3],
            residual: true,
        },
        ..Default::default()
    }
}

fn run_dir(root: &Path) -> PathBuf {
    root.join("cnn").join("luma")
}

// 2 nested batches per subset, 3 subsets
const STEPS_PER_EPOCH: u64 = 6;

#[test]
fn test_full_run_writes_checkpoint_and_summaries() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 3);
    write_dataset(&config.dataset_dir, 1e6);

    let mut trainer = Trainer::new(config.clone(), Session::cpu()).unwrap();
    let report = trainer.train().unwrap();

    assert_eq!(report.start_epoch, 0);
    assert_eq!(report.steps_per_epoch, STEPS_PER_EPOCH);
    assert_eq!(report.stop_reason, StopReason::MaxEpochs);
    assert_eq!(report.epochs.len(), 3);
    // the baseline never wins, so compete runs every combined batch
    assert_eq!(report.final_global_step, 3 * STEPS_PER_EPOCH);
    assert_eq!(report.epochs[2].skipped_batches, 0);
    assert!(report.best_val_error.is_some());

    let ckpt = run_dir(&config.checkpoint_dir);
    assert!(ckpt.join("model.safetensors").is_file());
    assert!(ckpt.join("state.json").is_file());
    let epochs_log = std::fs::read_to_string(ckpt.join("epochs.jsonl")).unwrap();
    assert_eq!(epochs_log.lines().count(), 3);

    let summary = run_dir(&config.log_dir).join("scalars.jsonl");
    let events = std::fs::read_to_string(summary).unwrap();
    assert!(events.contains("train/loss"));
    assert!(events.contains("val/error"));
}

#[test]
fn test_baseline_winning_everything_fails_validation() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 5);
    write_dataset(&config.dataset_dir, 0.0);

    let mut trainer = Trainer::new(config, Session::cpu()).unwrap();
    let err = trainer.train().unwrap_err();

    assert!(matches!(err, CompeteError::EmptyValidation { epoch: 2 }));
    // compete training skipped every batch
    assert_eq!(trainer.global_step(), 2 * STEPS_PER_EPOCH);
}

#[test]
fn test_frozen_model_stops_early() {
    let tmp = TempDir::new().unwrap();
    let config = CompeteConfig {
        early_stopping: 3,
        learning_rate: 1e-30,
        ..tiny_config(&tmp, 20)
    };
    write_dataset(&config.dataset_dir, 1e6);

    let mut trainer = Trainer::new(config.clone(), Session::cpu()).unwrap();
    let report = trainer.train().unwrap();

    // the first compete epoch takes the per-sample best branch and improves;
    // with frozen weights every later compete epoch repeats its error
    assert_eq!(report.stop_reason, StopReason::EarlyStopping { epoch: 5 });
    assert_eq!(report.epochs.len(), 6);
    let counters: Vec<usize> = report.epochs[2..]
        .iter()
        .map(|e| e.early_stop_counter)
        .collect();
    assert_eq!(counters, vec![0, 1, 2, 3]);
    let compete_error = report.epochs[2].val_error;
    assert!(report.epochs[3..]
        .iter()
        .all(|e| e.val_error == compete_error));
    assert_eq!(report.best_val_error, Some(compete_error));

    let epochs_log =
        std::fs::read_to_string(run_dir(&config.checkpoint_dir).join("epochs.jsonl")).unwrap();
    assert_eq!(epochs_log.lines().count(), 6);
}

#[test]
fn test_resume_starts_at_epoch_of_restored_step() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 2);
    write_dataset(&config.dataset_dir, 1e6);

    let first = Trainer::new(config.clone(), Session::cpu())
        .unwrap()
        .train()
        .unwrap();
    assert_eq!(first.final_global_step, 2 * STEPS_PER_EPOCH);

    let resumed_config = CompeteConfig {
        epoch: 4,
        ..config
    };
    let mut trainer = Trainer::new(resumed_config, Session::cpu()).unwrap();
    let second = trainer.train().unwrap();

    assert!(second.resumed_global_step > 0);
    assert_eq!(second.resumed_global_step % STEPS_PER_EPOCH, 0);
    assert_eq!(
        second.start_epoch as u64,
        second.resumed_global_step / STEPS_PER_EPOCH
    );
    assert_eq!(second.epochs[0].epoch, second.start_epoch);
    assert_eq!(second.epochs.last().unwrap().epoch, 3);
}

#[test]
fn test_trained_model_can_be_tested() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 1);
    write_dataset(&config.dataset_dir, 1e6);
    write_testset(&config.test_dataset_dir);

    Trainer::new(config.clone(), Session::cpu())
        .unwrap()
        .train()
        .unwrap();

    let report = run_test(&config, &Session::cpu()).unwrap();
    assert_eq!(report.categories.len(), 1);
    assert_eq!(report.total.samples, 5);
    assert!(report.total.switch_cost <= report.total.baseline_cost + 1e-9);
    assert!(run_dir(&config.results_dir).join("results.json").is_file());
}

#[test]
fn test_testing_without_checkpoint_is_model_load_error() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 1);
    write_testset(&config.test_dataset_dir);

    let err = run_test(&config, &Session::cpu()).unwrap_err();
    assert!(matches!(err, CompeteError::ModelLoad(_)));
}

#[test]
fn test_cancelled_run_stops_before_training() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(&tmp, 3);
    write_dataset(&config.dataset_dir, 1e6);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut trainer = Trainer::new(config.clone(), Session::cpu())
        .unwrap()
        .with_cancellation(cancel);
    let report = trainer.train().unwrap();

    assert_eq!(report.stop_reason, StopReason::Cancelled);
    assert!(report.epochs.is_empty());
    assert_eq!(trainer.global_step(), 0);
    assert!(!run_dir(&config.checkpoint_dir).join("state.json").exists());
}

#[test]
fn test_more_subsets_than_branches_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut config = tiny_config(&tmp, 2);
    config.model.branches = 2;
    write_dataset(&config.dataset_dir, 1e6);

    let err = Trainer::new(config, Session::cpu())
        .unwrap()
        .train()
        .unwrap_err();
    assert!(matches!(err, CompeteError::Dataset(_)));
}
