//! Operator commands for a running genqueue deployment.
//!
//! Every command connects to the store named by `GENQUEUE_REDIS_URL` (or
//! `--redis-url`), runs once and exits.

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::QueueConfig;
use crate::pipeline::{
    AiPipelineMetrics, AiPipelineRequest, CostOptimizationReport, PipelineOrchestrator, UseCase,
};
use crate::scheduler::QueueManager;

/// Default number of dead-letter entries shown.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 20;

/// Priority task queue and AI pipeline operator tool.
#[derive(Parser)]
#[command(name = "genqueue")]
#[command(about = "Inspect and feed the genqueue priority task queue")]
#[command(version)]
#[command(
    long_about = "genqueue manages a store-backed priority task queue with retries, dead-lettering and per-dependency circuit breakers, plus a cost-aware AI image-generation pipeline on top of it.\n\nExample usage:\n  genqueue stats\n  genqueue submit --use-case social --prompt \"a lighthouse at dusk\" --user u-42"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Store URL, overriding GENQUEUE_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show pending tasks and workers per priority class.
    Stats(OutputArgs),

    /// Check store connectivity; exits non-zero when unhealthy.
    Health(OutputArgs),

    /// List the most recent dead-lettered tasks.
    #[command(name = "dead-letters", alias = "dlq")]
    DeadLetters(DeadLettersArgs),

    /// Fail every task whose lease has expired and release due deferred tasks.
    Reap,

    /// Submit a single AI generation request.
    Submit(SubmitArgs),

    /// Print pipeline metrics and the cost optimization report as JSON.
    Metrics,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct DeadLettersArgs {
    /// Maximum number of entries to show, newest first.
    #[arg(short = 'n', long, default_value_t = DEFAULT_DEAD_LETTER_LIMIT)]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Use case: interactive, social, background or batch.
    #[arg(short = 'u', long)]
    pub use_case: UseCase,

    /// Generation prompt.
    #[arg(short = 'p', long)]
    pub prompt: String,

    /// Submitting user id.
    #[arg(long)]
    pub user: String,

    /// Required model capability (repeatable), e.g. pose-estimation.
    #[arg(short = 'c', long = "capability")]
    pub capabilities: Vec<String>,

    /// Override the use case's quality threshold.
    #[arg(long)]
    pub quality_threshold: Option<f64>,
}

#[derive(Debug, Serialize)]
struct MetricsOutput {
    pipeline: AiPipelineMetrics,
    cost_report: CostOptimizationReport,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let queue = connect(cli.redis_url).await?;

    match cli.command {
        Commands::Stats(args) => run_stats_command(&queue, args).await,
        Commands::Health(args) => run_health_command(&queue, args).await,
        Commands::DeadLetters(args) => run_dead_letters_command(&queue, args).await,
        Commands::Reap => run_reap_command(&queue).await,
        Commands::Submit(args) => run_submit_command(queue, args).await,
        Commands::Metrics => run_metrics_command(queue).await,
    }
}

async fn connect(redis_url: Option<String>) -> anyhow::Result<Arc<QueueManager>> {
    let mut config = QueueConfig::from_env()?;
    if let Some(url) = redis_url {
        config = config.with_redis_url(url);
    }
    config.validate()?;

    Ok(Arc::new(QueueManager::connect(config).await?))
}

async fn run_stats_command(queue: &QueueManager, args: OutputArgs) -> anyhow::Result<()> {
    let stats = queue.get_queue_stats().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<12} {:>8} {:>8} {:>9} {:>7}", "PRIORITY", "PENDING", "WORKERS", "CAPACITY", "USED");
    for (priority, s) in &stats {
        println!(
            "{:<12} {:>8} {:>8} {:>9} {:>6.1}%",
            priority.as_str(),
            s.pending,
            s.active_workers,
            s.capacity,
            s.utilization() * 100.0
        );
    }
    Ok(())
}

async fn run_health_command(queue: &QueueManager, args: OutputArgs) -> anyhow::Result<()> {
    let report = queue.health_check().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Status:       {:?}", report.status);
        println!("Checked at:   {}", report.checked_at.to_rfc3339());
        if let Some(error) = &report.details.error {
            println!("Error:        {}", error);
        }
        println!("Dead letters: {}", report.details.dead_letters);
        for (dependency, breaker) in &report.details.breakers {
            println!("Breaker {:<20} {} ({} failures)", dependency, breaker.state, breaker.failures);
        }
    }

    if !report.is_healthy() {
        anyhow::bail!("queue store is unhealthy");
    }
    Ok(())
}

async fn run_dead_letters_command(queue: &QueueManager, args: DeadLettersArgs) -> anyhow::Result<()> {
    let entries = queue.dead_letters().peek(args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

async fn run_reap_command(queue: &QueueManager) -> anyhow::Result<()> {
    let reclaimed = queue.reap_expired_leases().await?;
    let released = queue.promote_deferred().await?;
    info!(reclaimed = reclaimed, released = released, "Lease reap complete");
    println!("{}", reclaimed);
    Ok(())
}

async fn run_submit_command(queue: Arc<QueueManager>, args: SubmitArgs) -> anyhow::Result<()> {
    let mut request = AiPipelineRequest::new(args.user, args.use_case).with_prompt(args.prompt);
    for capability in args.capabilities {
        request = request.with_capability(capability);
    }
    if let Some(threshold) = args.quality_threshold {
        request = request.with_quality_threshold(threshold);
    }

    let pipeline = PipelineOrchestrator::new(queue);
    let task_id = pipeline.submit_ai_task(request).await?;
    println!("{}", task_id);
    Ok(())
}

async fn run_metrics_command(queue: Arc<QueueManager>) -> anyhow::Result<()> {
    let pipeline = PipelineOrchestrator::new(queue);
    let output = MetricsOutput {
        pipeline: pipeline.get_ai_pipeline_metrics().await?,
        cost_report: pipeline.get_cost_optimization_report().await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "genqueue",
            "submit",
            "--use-case",
            "social",
            "--prompt",
            "a lighthouse",
            "--user",
            "u-42",
            "-c",
            "pose-estimation",
            "-c",
            "face-preservation",
        ])
        .unwrap();

        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.use_case, UseCase::Social);
        assert_eq!(args.capabilities.len(), 2);
        assert!(args.quality_threshold.is_none());
    }

    #[test]
    fn test_parse_dead_letters_default_limit() {
        let cli = Cli::try_parse_from(["genqueue", "dlq", "--redis-url", "redis://cache:6379"]).unwrap();
        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6379"));
        let Commands::DeadLetters(args) = cli.command else {
            panic!("expected dead-letters");
        };
        assert_eq!(args.limit, DEFAULT_DEAD_LETTER_LIMIT);
    }

    #[test]
    fn test_unknown_use_case_is_rejected() {
        let result = Cli::try_parse_from([
            "genqueue", "submit", "--use-case", "viral", "--prompt", "x", "--user", "u",
        ]);
        assert!(result.is_err());
    }
}
