use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use idgov_storage::{MemoryWarehouse, Warehouse};
use idgov_sync::{JobId, JobRegistry, JobRunSummary, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "idgov-cli")]
#[command(about = "Identity governance sync jobs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job now, whether or not it is enabled for scheduling.
    Run {
        job: JobId,
        /// Write into an in-memory warehouse and skip helpdesk write-back.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List registered jobs with their schedules.
    Jobs,
    /// Run enabled jobs on their cron schedules until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("IDGOV_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn print_summary(summary: &JobRunSummary) {
    println!(
        "{} complete: run_id={} tables={} rows={}",
        summary.job,
        summary.run_id,
        summary.tables.len(),
        summary.rows_written()
    );
    for table in &summary.tables {
        println!(
            "  {:<34} {:>8} rows {:>4} batches  {}",
            table.table, table.rows, table.batches, table.mode
        );
    }
    if let Some(lifecycle) = &summary.lifecycle {
        println!(
            "  provisioned={} deactivation_candidates={} population={} gate_permitted={} deactivated={} applied={}",
            lifecycle.provisioned.len(),
            lifecycle.deactivation_candidates,
            lifecycle.population,
            lifecycle.gate_permitted,
            lifecycle.deactivated.len(),
            lifecycle.applied
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Jobs) {
        Commands::Run { job, dry_run, json } => {
            let mut pipeline = SyncPipeline::new(config.clone())?;
            let memory = if dry_run {
                let memory = Arc::new(MemoryWarehouse::new(config.warehouse_parameter_limit));
                pipeline = pipeline
                    .with_warehouse(Warehouse::new(memory.clone()))
                    .with_write_back(false);
                Some(memory)
            } else {
                None
            };

            let summary = pipeline.run_job(job).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("encoding summary")?
                );
            } else {
                print_summary(&summary);
            }
            if let Some(memory) = memory {
                println!("dry run, warehouse untouched; in-memory tables:");
                for name in memory.table_names() {
                    let rows = memory.table(&name).map(|t| t.len()).unwrap_or(0);
                    println!("  {name:<34} {rows:>8} rows");
                }
            }
        }
        Commands::Jobs => {
            let registry = JobRegistry::load(&config.jobs_file)?;
            for job in registry.jobs() {
                println!(
                    "{:<18} {:<8} {:<20} {} tables",
                    job.id.name(),
                    if job.enabled { "enabled" } else { "disabled" },
                    job.cron,
                    job.tables().len()
                );
            }
        }
        Commands::Schedule => {
            let pipeline = SyncPipeline::new(config)?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set IDGOV_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(jobs = pipeline.registry().enabled().count(), "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
