use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use mesw_core::{FileKey, ImportStatus};
use mesw_storage::Warehouse;
use mesw_sync::{report_runs_markdown, EtlConfig, EtlPipeline};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "mesw-cli")]
#[command(about = "MES/SAP reporting warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import new or changed extracts, then refresh KPIs and alerts.
    Run {
        /// KPI windows end on this date instead of today.
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    Migrate,
    /// Import state of the files a pipeline has seen.
    Status {
        pipeline: String,
        #[arg(long)]
        status: Option<ImportStatus>,
    },
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Archived versions of one source file.
    Archive { pipeline: String, file: String },
    Kpi {
        kpi_id: String,
        #[arg(long)]
        tag: Option<String>,
    },
    Alerts {
        #[command(subcommand)]
        action: AlertCommands,
    },
    /// Fiscal year, week and month of a date.
    Calendar { date: NaiveDate },
}

#[derive(Debug, Subcommand)]
enum AlertCommands {
    List {
        #[arg(long)]
        kpi: Option<String>,
        /// Include resolved cases.
        #[arg(long)]
        all: bool,
    },
    Ack { case_id: Uuid },
    Resolve {
        case_id: Uuid,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { as_of: None }) {
        Commands::Run { as_of } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            let cancel = pipeline.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing files already started");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let summary = pipeline
                .run_once_as_of(as_of.unwrap_or_else(|| Utc::now().date_naive()))
                .await?;
            let totals = summary.totals();
            println!(
                "run complete: run_id={} files={} inserted={} duplicates={} updated={} failed_files={} alerts_opened={} alerts_resolved={} reports={}",
                summary.run_id,
                summary.files.len(),
                totals.inserted,
                totals.skipped_duplicate,
                totals.updated,
                summary.failed_files().count(),
                summary.kpi.alerts_opened,
                summary.kpi.alerts_resolved,
                summary.reports_dir
            );
        }
        Commands::Schedule => {
            let config = EtlConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = EtlPipeline::from_config(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let warehouse = Warehouse::connect(&config.warehouse_config()).await?;
            warehouse.migrate().await?;
            println!("warehouse schema up to date: {}", config.database_url);
        }
        Commands::Status { pipeline: name, status } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            for state in pipeline.tracker().list(&name, status).await? {
                println!(
                    "{:<8} {:>7} rows {:>5} rejected  attempts={} {}{}",
                    state.status,
                    state.rows_imported,
                    state.rows_rejected,
                    state.attempts,
                    state.file_path,
                    state
                        .error_detail
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, Some(config.workspace_root))?);
        }
        Commands::Archive { pipeline: name, file } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            let key = FileKey::new(&file);
            let dir = pipeline.archive().file_dir(&name, &key);
            for entry in pipeline.archive().versions(&name, &key).await? {
                println!(
                    "{} {:>10} bytes  discovered={}  {}",
                    entry.archived_at,
                    entry.size,
                    entry.discovered_at,
                    dir.join(&entry.stored_as).display()
                );
            }
        }
        Commands::Kpi { kpi_id, tag } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            for record in pipeline.kpi_store().records(&kpi_id, tag.as_deref()).await? {
                let value = record
                    .progress_value
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{} {:<12} {:>12}  {}", record.created_date, record.tag, value, record.details);
            }
        }
        Commands::Alerts { action } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            let store = pipeline.kpi_store();
            match action {
                AlertCommands::List { kpi, all } => {
                    let cases = if all {
                        store.all_cases(kpi.as_deref()).await?
                    } else {
                        store.open_cases(kpi.as_deref()).await?
                    };
                    for case in cases {
                        println!(
                            "{} {:<12} {} {:<10} observed={} threshold={} trigger={}",
                            case.case_id(),
                            case.status,
                            case.kpi_id,
                            case.tag,
                            case.observed_value,
                            case.threshold,
                            case.trigger_date
                        );
                    }
                }
                AlertCommands::Ack { case_id } => {
                    let case = store.acknowledge(case_id).await?;
                    println!("{} {}", case.case_id(), case.status);
                }
                AlertCommands::Resolve { case_id, date } => {
                    let case = store
                        .resolve(case_id, date.unwrap_or_else(|| Utc::now().date_naive()))
                        .await?;
                    println!("{} {}", case.case_id(), case.status);
                }
            }
        }
        Commands::Calendar { date } => {
            let pipeline = EtlPipeline::from_config(config).await?;
            let period = pipeline.calendar().resolve(date)?;
            println!(
                "{} {} {} {}",
                period.date,
                period.year_label(),
                period.week_label(),
                period.month_label()
            );
        }
    }

    Ok(())
}
