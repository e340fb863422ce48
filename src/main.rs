//! CLI entry point for compete-cnn-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compete_cnn_rs::{run_test, CompeteConfig, Result, Session, Trainer};

#[derive(Parser)]
#[command(name = "compete-cnn")]
#[command(about = "Train and test a multi-branch CNN against a baseline predictor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Train, resuming from the run's checkpoint if one exists
    Train {
        /// Path to configuration file
        config: String,
    },
    /// Evaluate the trained model on the test split
    Test {
        /// Path to configuration file
        config: String,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = CompeteConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Model: {}", config.model_name);
            println!("  Dataset: {}", config.dataset_dir.display());
            println!("  Branches: {}", config.model.branches);
            println!("  Loss: {}", config.loss.name());
        }
        Commands::Train { config } => {
            tracing::info!("Starting training with config: {}", config);
            let config = CompeteConfig::from_file(&config)?;
            let mut trainer = Trainer::new(config, Session::from_env())?;
            let report = trainer.train()?;
            println!("✓ Training finished after {} epochs", report.epochs.len());
            println!("  Stop reason: {:?}", report.stop_reason);
            println!("  Global step: {}", report.final_global_step);
            if let Some(best) = report.best_val_error {
                println!("  Best validation error: {best:.6}");
            }
        }
        Commands::Test { config } => {
            tracing::info!("Testing with config: {}", config);
            let config = CompeteConfig::from_file(&config)?;
            config.validate()?;
            let report = run_test(&config, &Session::from_env())?;
            println!("✓ Results for {} categories", report.categories.len());
            println!("  NN cost: {:.4}", report.total.nn_cost);
            println!("  Baseline cost: {:.4}", report.total.baseline_cost);
            println!("  Switch cost: {:.4}", report.total.switch_cost);
        }
        Commands::Init { output } => {
            CompeteConfig::default().to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
