//! Integration tests for the compete-cnn CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path, content: &str) -> String {
    let config_path = dir.join("config.yaml");
    fs::write(&config_path, content).expect("Failed to write test config");
    config_path.to_str().expect("utf-8 path").to_string()
}

fn run_cli(args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("compete-cnn").expect("Failed to find compete-cnn binary");
    cmd.args(args);
    cmd
}

fn valid_config_yaml() -> &'static str {
    r#"
model_name: competition
dataset_dir: ./data/luma_4x4
batch_size: 16
epoch: 20
early_stopping: 5
learning_rate: 0.0001
gradient_clip: 1.0
loss: sad
model:
  branches: 15
  hidden_channels: [64, 32]
  kernel_sizes: [9, 1, 5]
"#
}

#[test]
fn test_validate_command_valid_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(temp_dir.path(), valid_config_yaml());

    run_cli(&["validate", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"))
        .stdout(predicate::str::contains("Loss: sad"));
}

#[test]
fn test_validate_command_rejects_even_kernel() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = write_config(
        temp_dir.path(),
        "model_name: cnn\ndataset_dir: ./data\nmodel:\n  kernel_sizes: [9, 2, 5]\n",
    );

    run_cli(&["validate", &config])
        .assert()
        .failure()
        .stderr(predicate::str::contains("odd"));
}

#[test]
fn test_validate_command_missing_file() {
    run_cli(&["validate", "/nonexistent/config.yaml"])
        .assert()
        .failure();
}

#[test]
fn test_init_writes_loadable_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = temp_dir.path().join("generated.yaml");
    let output = output.to_str().expect("utf-8 path");

    run_cli(&["init", output])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    run_cli(&["validate", output]).assert().success();
}

#[test]
fn test_test_command_without_checkpoint_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let yaml = format!(
        "model_name: cnn\ndataset_dir: ./data/set\ncheckpoint_dir: {}\n",
        temp_dir.path().join("ckpt").display()
    );
    let config = write_config(temp_dir.path(), &yaml);

    run_cli(&["test", &config])
        .env("COMPETE_FORCE_CPU", "1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no trained checkpoint"));
}

#[test]
fn test_help_lists_subcommands() {
    run_cli(&["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("train"))
        .stdout(predicate::str::contains("test"));
}
