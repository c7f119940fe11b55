use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use swm_sync::{IngestOutcome, ObjectEvent, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swm-cli")]
#[command(about = "Weighbridge ingestion and dashboard query service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect one day from every enabled source and rebuild the viz table.
    Sync {
        /// Target date (YYYY-MM-DD); defaults to SWM_TARGET_DATE, then yesterday.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print the full run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Append one backup object to its source table and rebuild the viz table.
    IngestObject {
        name: String,
        /// Bucket the event came from; defaults to the configured bucket.
        #[arg(long)]
        bucket: Option<String>,
    },
    RebuildViz,
    Serve,
    /// Run the sync on SWM_SYNC_CRON until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        date: None,
        json: false,
    }) {
        Commands::Sync { date, json } => {
            let mut config = SyncConfig::from_env();
            if date.is_some() {
                config.target_date = date;
            }
            let summary = SyncPipeline::new(config)?.run_once().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} date={} sources={} records={} failed_files={} failed_endpoints={} viz_rows={} dropped={} reports={}",
                    summary.run_id,
                    summary.target_date,
                    summary.enabled_sources,
                    summary.raw_records,
                    summary.failed_files,
                    summary.failed_endpoints,
                    summary.viz.viz_rows,
                    summary.viz.dropped_rows,
                    summary.reports_dir
                );
            }
        }
        Commands::IngestObject { name, bucket } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
            let event = ObjectEvent {
                bucket: bucket.unwrap_or_else(|| pipeline.registry().store.bucket().to_string()),
                name,
            };
            match pipeline.ingest_object(&event).await? {
                IngestOutcome::Ignored { reason } => {
                    println!("ignored {}: {:?}", event.name, reason);
                }
                IngestOutcome::Processed {
                    source_id,
                    records,
                    table,
                    viz,
                } => {
                    println!(
                        "ingested {}: source={} records={} table_rows={} duplicates_removed={} viz_rows={}",
                        event.name, source_id, records, table.total_rows, table.duplicates_removed, viz.viz_rows
                    );
                }
            }
        }
        Commands::RebuildViz => {
            let viz = SyncPipeline::new(SyncConfig::from_env())?.rebuild_viz().await?;
            println!(
                "viz rebuilt: tables={} combined={} viz_rows={} dropped={} written={}",
                viz.source_tables, viz.combined_rows, viz.viz_rows, viz.dropped_rows, viz.written
            );
        }
        Commands::Serve => {
            swm_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
