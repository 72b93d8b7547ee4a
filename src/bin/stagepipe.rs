//! stagepipe CLI: run a batch of work items through the pipeline.

use clap::{Parser, Subcommand};
use stagepipe::capability::sim::{SimulatedPersist, SimulatedTransform};
use stagepipe::config::{Config, split_items};
use stagepipe::engine::{Pipeline, RunReport};
use stagepipe::model::WorkItem;
use stagepipe::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "stagepipe", about = "Two-stage work pipeline with backpressure")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline over a list of items using simulated stages
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML config file; environment variables are applied on top
    #[arg(long)]
    config: Option<PathBuf>,
    /// Comma-separated item ids (defaults to a built-in sample set)
    #[arg(long)]
    items: Option<String>,
    #[arg(long)]
    transform_workers: Option<usize>,
    #[arg(long)]
    persist_workers: Option<usize>,
    #[arg(long)]
    transform_capacity: Option<usize>,
    #[arg(long)]
    persist_capacity: Option<usize>,
    /// Total persist attempts per item (1 = no retry)
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    base_delay_ms: Option<u64>,
    #[arg(long)]
    jitter_ms: Option<u64>,
    /// Cancel the run after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,
    /// Make the simulated transform fail for this item id (repeatable)
    #[arg(long = "fail-transform")]
    fail_transform: Vec<String>,
    /// Probability that a simulated persist attempt fails
    #[arg(long, default_value_t = 0.0)]
    persist_failure_rate: f64,
    #[arg(long, default_value_t = 50)]
    transform_latency_ms: u64,
    #[arg(long, default_value_t = 20)]
    persist_latency_ms: u64,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => cmd_run(args).await,
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "stagepipe"))?;

    let mut transform = SimulatedTransform::new(Duration::from_millis(args.transform_latency_ms));
    for id in &args.fail_transform {
        transform = transform.fail_on(id);
    }
    let persist = SimulatedPersist::new(
        Duration::from_millis(args.persist_latency_ms),
        args.persist_failure_rate,
    );

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c.cancel();
    });

    let pipeline = Pipeline::new(
        config.pipeline_config(),
        Arc::new(transform),
        Arc::new(persist),
    )?
    .with_cancellation(&shutdown);

    let report = pipeline.run(WorkItem::from_ids(config.items.clone())).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn load_config(args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(items) = &args.items {
        config.items = split_items(items);
    }
    config.set_workers(args.transform_workers, args.persist_workers);
    if let Some(n) = args.transform_capacity {
        config.transform_queue_capacity = n;
    }
    if let Some(n) = args.persist_capacity {
        config.persist_queue_capacity = n;
    }
    if let Some(n) = args.max_attempts {
        config.retry_max_attempts = n;
    }
    if let Some(ms) = args.base_delay_ms {
        config.retry_base_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = args.jitter_ms {
        config.retry_jitter_max = Duration::from_millis(ms);
    }
    if let Some(ms) = args.deadline_ms {
        config.run_deadline = Some(Duration::from_millis(ms));
    }

    config.validate()?;
    Ok(config)
}

fn print_report(report: &RunReport) {
    println!("{:<24}  {:<8}  {:<8}  ERROR", "ITEM", "RESULT", "ATTEMPTS");
    println!("{}", "-".repeat(72));
    for outcome in &report.outcomes {
        let (result, error) = match &outcome.error {
            None => ("ok", "-".to_string()),
            Some(err) => ("failed", err.to_string()),
        };
        println!(
            "{:<24}  {:<8}  {:<8}  {}",
            outcome.item.id, result, outcome.attempts, error
        );
    }

    println!();
    println!("Run:        {}", report.run_id);
    println!("Submitted:  {}", report.submitted);
    println!("Succeeded:  {}", report.succeeded);
    println!("Failed:     {}", report.failed);
    println!("Dropped:    {}", report.dropped());
    if report.cancelled {
        println!("Cancelled:  yes");
    }
    println!(
        "Duration:   {}ms",
        (report.finished_at - report.started_at).num_milliseconds()
    );
}
