use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::agent::ShellSession;
use crate::config::Config;
use crate::harness::{FailureMode, TaskAgent};

#[derive(Debug, Parser)]
#[command(name = "pca", version, about = "Shell agent that works a task one bash command at a time")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one task against a local shell
    Run {
        /// Task instruction given to the model
        instruction: String,
        /// Config file (defaults to ~/.pca/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Model id override
        #[arg(long)]
        model: Option<String>,
        /// Directory for run.log and trajectory.json
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Step ceiling override (0 = unlimited)
        #[arg(long)]
        max_steps: Option<usize>,
        /// Shell program backing the session
        #[arg(long, default_value = "bash")]
        shell: String,
    },
    /// Write the default config file
    Onboard,
}

fn run_onboard() -> Result<()> {
    let path = Config::default_path();
    if path.exists() {
        println!("Config already exists: {}", path.display());
        return Ok(());
    }

    Config::default()
        .save(&path)
        .with_context(|| format!("failed to save config: {}", path.display()))?;
    println!("Saved config: {}", path.display());
    println!("Set ANTHROPIC_API_KEY (or transport.api_key) before running a task.");
    Ok(())
}

async fn run_task(
    instruction: String,
    config_path: Option<PathBuf>,
    model: Option<String>,
    log_dir: Option<PathBuf>,
    max_steps: Option<usize>,
    shell: String,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::load_default()?,
    };
    if let Some(model) = model {
        config.transport.model = model;
    }
    if let Some(max_steps) = max_steps {
        config.workflow.max_steps = max_steps;
    }

    let agent = TaskAgent::new(config);
    let mut session = ShellSession::new(shell);
    let result = agent
        .perform_task_async(&instruction, &mut session, log_dir.as_deref())
        .await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.failure_mode != FailureMode::None {
        std::process::exit(1);
    }
    Ok(())
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            instruction,
            config,
            model,
            log_dir,
            max_steps,
            shell,
        } => run_task(instruction, config, model, log_dir, max_steps, shell).await,
        Command::Onboard => run_onboard(),
    }
}
