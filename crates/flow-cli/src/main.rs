use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flow_sync::{SyncConfig, SyncPipeline, Task};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "flow-importer")]
#[command(about = "Synchronizes the UW Flow course catalog from the university open data API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import courses, requisites, instructors, sections and meetings.
    Courses,
    /// Import term boundaries.
    Terms,
    /// Terms, then courses.
    Hourly,
    /// Import the current term's exam schedule.
    Exams,
    /// Delete sections outside the retention window and orphaned instructors.
    Vacuum,
    /// Run hourly and vacuum tasks on their crons until interrupted.
    Schedule,
}

impl Commands {
    fn task(&self) -> Option<Task> {
        match self {
            Commands::Courses => Some(Task::Courses),
            Commands::Terms => Some(Task::Terms),
            Commands::Hourly => Some(Task::Hourly),
            Commands::Exams => Some(Task::Exams),
            Commands::Vacuum => Some(Task::Vacuum),
            Commands::Schedule => None,
        }
    }
}

fn init_tracing() {
    let json = std::env::var("FLOW_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;

    let command = cli.command.unwrap_or(Commands::Hourly);
    let Some(task) = command.task() else {
        return run_scheduler(pipeline).await;
    };

    let cancel = pipeline.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling in-flight fetches");
            cancel.cancel();
        }
    });

    let summary = pipeline.run(task).await;
    println!(
        "{}",
        serde_json::to_string(&summary).context("serializing run summary")?
    );
    if !summary.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_scheduler(pipeline: SyncPipeline) -> Result<()> {
    let pipeline = Arc::new(pipeline);
    let mut sched = flow_sync::build_scheduler(pipeline.clone()).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        hourly = %pipeline.config().hourly_cron,
        vacuum = %pipeline.config().vacuum_cron,
        "scheduler running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down scheduler");
    pipeline.cancellation().cancel();
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
