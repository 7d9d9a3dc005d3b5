use chrono::{DateTime, Utc};
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

mod cli;

use cli::Cli;
use cli::commands::{CheckpointCommands, Commands, LearnedCommands, LimitsCommands};
use gatekeeper::{GatekeeperConfig, GatekeeperError};
use gatekeeper::cost::CostEstimator;
use gatekeeper::id::now_ms;
use gatekeeper::limits::{DEFAULT_TIER, RateLimit};
use gatekeeper::ratelimit::AdaptiveRateController;
use gatekeeper::types::TaskSource;

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatekeeper")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("gatekeeper.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}

fn format_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{:.1}m", ms as f64 / 60_000.0)
    } else {
        format!("{:.1}s", ms as f64 / 1_000.0)
    }
}

fn format_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn run_application(cli: &Cli, config: &GatekeeperConfig) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{} {}", "State directory:".yellow(), config.state_dir().display());
    }

    match &cli.command {
        Commands::Limits { command } => handle_limits_command(command, cli.json, config).await,
        Commands::Learned { command } => handle_learned_command(command, cli.json, config).await,
        Commands::Checkpoints { command } => handle_checkpoint_command(command, cli.json, config).await,
        Commands::Estimate {
            source,
            provider,
            model,
            description,
        } => handle_estimate_command(
            source,
            provider.as_deref(),
            model.as_deref(),
            description.as_deref(),
            cli.json,
            config,
        ),
    }
}

async fn handle_limits_command(command: &LimitsCommands, json: bool, config: &GatekeeperConfig) -> Result<()> {
    info!("Handling limits command: {:?}", command);
    let registry = config.build_registry().await?;

    match command {
        LimitsCommands::Resolve { provider, model, tier } => {
            let resolved = registry.resolve(provider, model, tier.as_deref());
            if json {
                return print_json(&resolved);
            }
            println!("{} {}:{}", "Limit for".green(), provider, model);
            println!("  rpm:         {}", resolved.rpm);
            println!("  concurrency: {}", resolved.concurrency);
            println!("  tier:        {}", resolved.tier);
            println!("  source:      {}", resolved.source.to_string().cyan());
        }
        LimitsCommands::Show { provider } => {
            let entries: Vec<_> = registry
                .entries()
                .into_iter()
                .filter(|e| provider.as_ref().is_none_or(|p| e.provider.eq_ignore_ascii_case(p)))
                .collect();
            if json {
                return print_json(&entries);
            }
            println!(
                "{:<12} {:<28} {:<10} {:>8} {:>12}",
                "PROVIDER".bold(),
                "PATTERN".bold(),
                "TIER".bold(),
                "RPM".bold(),
                "CONCURRENCY".bold()
            );
            for entry in entries {
                println!(
                    "{:<12} {:<28} {:<10} {:>8} {:>12}",
                    entry.provider,
                    entry.pattern.as_deref().unwrap_or("*"),
                    entry.tier,
                    entry.limit.rpm,
                    entry.limit.concurrency
                );
            }
        }
        LimitsCommands::Set {
            provider,
            pattern,
            tier,
            rpm,
            concurrency,
        } => {
            if *concurrency == 0 || *rpm == 0 {
                eyre::bail!("rpm and concurrency must be > 0");
            }
            let limit = RateLimit::new(*rpm, *concurrency);
            let mut table = registry.user_limits();
            let entry = table.entry(provider.to_lowercase()).or_default();
            match (pattern, tier) {
                (Some(pattern), tier) => {
                    entry
                        .models
                        .entry(pattern.to_lowercase())
                        .or_default()
                        .insert(tier.clone().unwrap_or_else(|| DEFAULT_TIER.to_string()), limit);
                }
                (None, Some(tier)) => {
                    entry.tiers.insert(tier.clone(), limit);
                }
                (None, None) => entry.default = Some(limit),
            }
            registry
                .save_user_limits(&table)
                .await
                .context("Failed to save provider limits")?;
            println!(
                "{} {} {} rpm / {} concurrent ({})",
                "Saved override:".green(),
                provider,
                rpm,
                concurrency,
                config.limits_file().display()
            );
        }
        LimitsCommands::Reload => {
            let count = registry.reload_limits().await.context("Failed to reload provider limits")?;
            println!("{} {} providers with overrides", "Reloaded:".green(), count);
        }
    }
    Ok(())
}

async fn handle_learned_command(command: &LearnedCommands, json: bool, config: &GatekeeperConfig) -> Result<()> {
    info!("Handling learned command: {:?}", command);
    let registry = config.build_registry().await?;
    let controller = config.build_controller(registry).await?;

    match command {
        LearnedCommands::Show => {
            let limits = controller.get_all_learned_limits();
            if json {
                return print_json(&limits);
            }
            if limits.is_empty() {
                println!("{}", "No learned limits".yellow());
                return Ok(());
            }
            let now = now_ms();
            println!(
                "{:<36} {:>8} {:>8} {:>8} {:>20} {:>10}",
                "KEY".bold(),
                "LIMIT".bold(),
                "PRESET".bold(),
                "429s".bold(),
                "LAST 429".bold(),
                "RECOVERY".bold()
            );
            for (key, limit) in limits {
                let recovery = match limit.recovery_due_at {
                    Some(due) if limit.recovery_scheduled => format_ms(due.saturating_sub(now)),
                    _ => "-".to_string(),
                };
                let current = if limit.concurrency < limit.original_concurrency {
                    limit.concurrency.to_string().red()
                } else {
                    limit.concurrency.to_string().green()
                };
                let last_429 = limit.last_429_at.map(format_timestamp).unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36} {:>8} {:>8} {:>8} {:>20} {:>10}",
                    key, current, limit.original_concurrency, limit.total_429_count, last_429, recovery
                );
            }
        }
        LearnedCommands::Reset { provider, model } => {
            AdaptiveRateController::build_key(provider, model).context("Cannot reset learned limit")?;
            if controller.reset_learned_limit(provider, model).await {
                println!("{} {}:{}", "Reset:".green(), provider, model);
            } else {
                println!("{} {}:{}", "No learned limit for".yellow(), provider, model);
            }
        }
        LearnedCommands::Multiplier { value } => {
            controller.set_global_multiplier(*value).await;
            let applied = controller.snapshot().map(|s| s.global_multiplier).unwrap_or(*value);
            println!("{} {:.2}", "Global multiplier:".green(), applied);
        }
        LearnedCommands::Recover => {
            let recovered = controller.process_recovery().await;
            println!("{} {}", "Recovered:".green(), recovered);
        }
    }
    Ok(())
}

async fn handle_checkpoint_command(command: &CheckpointCommands, json: bool, config: &GatekeeperConfig) -> Result<()> {
    info!("Handling checkpoints command: {:?}", command);
    let store = config.build_checkpoints();

    match command {
        CheckpointCommands::List { expired } => {
            let checkpoints = if *expired {
                store.list_expired().await
            } else {
                store.list().await
            }
            .context("Failed to list checkpoints")?;
            if json {
                return print_json(&checkpoints);
            }
            if checkpoints.is_empty() {
                println!("{}", "No checkpoints".yellow());
                return Ok(());
            }
            let now = now_ms();
            for checkpoint in checkpoints {
                let age = format_ms(now.saturating_sub(checkpoint.created_at));
                println!(
                    "{} {} {} {}:{} {} {:.0}% ({} old)",
                    format_timestamp(checkpoint.created_at),
                    checkpoint.task_id.cyan(),
                    checkpoint.source,
                    checkpoint.provider,
                    checkpoint.model,
                    checkpoint.priority,
                    checkpoint.progress * 100.0,
                    age
                );
            }
        }
        CheckpointCommands::Show { task_id } => {
            match store.require(task_id).await {
                Ok(checkpoint) => print_json(&checkpoint)?,
                Err(GatekeeperError::NotFound(_)) => println!("{} {}", "No live checkpoint for".yellow(), task_id),
                Err(e) => return Err(e).context("Failed to read checkpoint"),
            }
        }
        CheckpointCommands::Delete { task_id } => {
            if store.delete(task_id).await.context("Failed to delete checkpoint")? {
                println!("{} {}", "Deleted:".green(), task_id);
            } else {
                println!("{} {}", "No checkpoint for".yellow(), task_id);
            }
        }
        CheckpointCommands::Cleanup => {
            let removed = store.cleanup().await.context("Failed to clean up checkpoints")?;
            println!("{} {} expired checkpoints", "Removed:".green(), removed);
        }
    }
    Ok(())
}

fn handle_estimate_command(
    source: &str,
    provider: Option<&str>,
    model: Option<&str>,
    description: Option<&str>,
    json: bool,
    config: &GatekeeperConfig,
) -> Result<()> {
    info!("Estimating cost for source: {}", source);
    let source: TaskSource = source.parse()?;
    let estimator = CostEstimator::new(config.cost.clone());
    let estimate = estimator.estimate(source, provider, model, description);

    if json {
        return print_json(&estimate);
    }
    println!("{} {}", "Estimate for".green(), source);
    println!("  duration:   {}", format_ms(estimate.estimated_duration_ms));
    println!("  tokens:     {}", estimate.estimated_tokens);
    println!("  confidence: {:.2}", estimate.confidence);
    println!("  method:     {}", estimate.method.as_str());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();

    let config = GatekeeperConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
