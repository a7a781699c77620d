use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use promptfleet::channel::{ChannelMetrics, Health};
use promptfleet::fleet::FleetMetrics;
use promptfleet::scheduler::Checkpoint;
use promptfleet::{FleetManager, Priority, RouteHint, SharedHandler, TaskRequest, TaskSpec, TaskStatus, handler_fn};

mod cli;
mod config;

use cli::Cli;
use cli::commands::{Commands, SimulateArgs};
use config::Config;

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptfleet")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("promptfleet.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let level = if verbose {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("info")
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Simulate(args) => handle_simulate_command(args, config).await,
        Commands::Config => handle_config_command(config),
        Commands::Checkpoint { path } => handle_checkpoint_command(path),
    }
}

/// Handler that sleeps around `latency_ms` and fails with probability `fail_rate`
fn synthetic_handler(latency_ms: u64, fail_rate: f64) -> SharedHandler {
    handler_fn(move |req: TaskRequest| async move {
        let (delay, fail) = {
            let mut rng = rand::rng();
            let delay = rng.random_range(latency_ms / 2..=latency_ms + latency_ms / 2);
            (delay, rng.random::<f64>() < fail_rate)
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if fail {
            eyre::bail!("synthetic failure for {} on {}", req.task_id, req.target_model);
        }
        Ok(format!("[{}] answered {}", req.target_model, req.payload))
    })
}

async fn handle_simulate_command(args: &SimulateArgs, config: &Config) -> Result<()> {
    info!("Simulating {} prompts: {:?}", args.count, args);
    if !(0.0..=1.0).contains(&args.fail_rate) {
        eyre::bail!("--fail-rate must be between 0.0 and 1.0, got {}", args.fail_rate);
    }

    let mut fleet_config = config.fleet.clone();
    if let Some(strategy) = args.strategy {
        fleet_config.strategy = strategy;
    }
    let fleet = FleetManager::new(fleet_config, synthetic_handler(args.latency_ms, args.fail_rate))
        .context("Failed to start fleet")?;

    println!(
        "{} {} prompts across {} channels ({})",
        "Routing".cyan(),
        args.count,
        fleet.channels().len(),
        if args.distributed {
            "distributed".to_string()
        } else {
            fleet.strategy().to_string()
        }
    );

    let specs: Vec<TaskSpec> = (1..=args.count)
        .map(|i| TaskSpec::new(format!("prompt #{}", i)).priority(args.priority))
        .collect();
    let routed = if args.distributed {
        fleet.enqueue_batch_distributed(specs)?
    } else {
        let hint = args.role.clone().map(RouteHint::role).unwrap_or_default();
        fleet.enqueue_batch(specs, hint)?
    };
    info!("Routed {} tasks", routed.len());

    let tasks = fleet
        .wait_for_all(Some(Duration::from_secs(args.timeout_secs)))
        .await
        .context("Simulation did not finish in time")?;

    let completed = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
    let failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
    println!(
        "{} {} completed, {} failed",
        "Done:".green(),
        completed.to_string().green(),
        failed.to_string().red()
    );
    if let Some(slowest) = tasks.iter().filter_map(|t| t.duration_ms()).max() {
        println!("{} {}ms", "Slowest final attempt:".cyan(), slowest);
    }

    let metrics = fleet.metrics();
    print_metrics(&metrics);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&metrics)?);
    }

    fleet.shutdown();
    Ok(())
}

fn print_metrics(metrics: &FleetMetrics) {
    println!();
    println!(
        "{:<12} {:<10} {:<10} {:>9} {:>7} {:>8} {:>10} {:>9}",
        "CHANNEL".bold(),
        "STATE".bold(),
        "HEALTH".bold(),
        "COMPLETED".bold(),
        "FAILED".bold(),
        "RETRIES".bold(),
        "AVG MS".bold(),
        "SUCCESS".bold()
    );
    for channel in &metrics.channels {
        print_channel(channel);
    }
    println!(
        "{:<12} {:<10} {:<10} {:>9} {:>7} {:>8} {:>10.1} {:>8.1}%",
        "total".bold(),
        "",
        "",
        metrics.total_completed,
        metrics.total_failed,
        metrics.total_retries,
        metrics.average_response_time_ms,
        metrics.success_rate
    );
}

fn print_channel(channel: &ChannelMetrics) {
    let health = match channel.health {
        Health::Healthy => "healthy".green(),
        Health::Degraded => "degraded".yellow(),
        Health::Unhealthy => "unhealthy".red(),
    };
    println!(
        "{:<12} {:<10} {:<10} {:>9} {:>7} {:>8} {:>10.1} {:>8.1}%",
        channel.name.cyan(),
        channel.state.to_string(),
        health,
        channel.total_completed,
        channel.total_failed,
        channel.total_retries,
        channel.average_response_time_ms,
        channel.success_rate
    );
}

fn handle_config_command(config: &Config) -> Result<()> {
    info!("Printing effective configuration");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}

fn handle_checkpoint_command(path: &Path) -> Result<()> {
    info!("Reading checkpoint: {}", path.display());
    let Some(checkpoint) =
        Checkpoint::load(path).context(format!("Failed to read checkpoint {}", path.display()))?
    else {
        println!("{} {}", "No checkpoint at".yellow(), path.display());
        return Ok(());
    };

    println!(
        "{} {} pending, next id {}",
        "Checkpoint:".green(),
        checkpoint.queued.len(),
        checkpoint.next_id
    );
    let mut queued = checkpoint.queued;
    queued.sort_by_key(|t| (t.priority, t.created_at, t.id));
    for task in &queued {
        let priority = match task.priority {
            Priority::Urgent => task.priority.as_str().red(),
            Priority::High => task.priority.as_str().yellow(),
            _ => task.priority.as_str().normal(),
        };
        let payload: String = task.payload.chars().take(60).collect();
        println!(
            "  {:<10} {:<10} attempts {}/{} {:<16} {}",
            task.id.to_string(),
            priority,
            task.attempts,
            task.max_retries + 1,
            task.target_model,
            payload
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    // Setup logging
    setup_logging(&config, cli.is_verbose()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
