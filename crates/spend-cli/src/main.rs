use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spend_storage::{AnomalyDetector, AnomalyReport, AnomalyThresholds, PaymentStore};
use spend_sync::{report::recent_briefs, RunOptions, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spend-cli")]
#[command(about = "UK council spending ingestion and anomaly checks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every discovered source and ingest new payments.
    Sync {
        /// Attach supplier coordinates via Nominatim (slow: one lookup per second).
        #[arg(long)]
        geocode: bool,
        /// Only sync this council.
        #[arg(long)]
        council: Option<String>,
        /// Ignore the cached catalog.
        #[arg(long)]
        refresh_catalog: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Discover spending datasets and print the catalog.
    Catalog {
        #[arg(long)]
        refresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run the anomaly queries.
    Anomalies {
        #[arg(long)]
        council: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 100_000.0)]
        large_over: f64,
        #[arg(long, default_value_t = 5)]
        frequent_over: i64,
    },
    /// List council overrides and councils with stored payments.
    Councils,
    /// Print the briefs of recent sync runs.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
    /// Run syncs on the SYNC_CRON schedule until interrupted.
    ServeScheduler,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn open_store(config: &SyncConfig) -> Result<PaymentStore> {
    let store = PaymentStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        geocode: false,
        council: None,
        refresh_catalog: false,
    }) {
        Commands::Sync {
            geocode,
            council,
            refresh_catalog,
        } => {
            config.geocode_enabled |= geocode;
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline
                .run_once(&RunOptions {
                    geocode,
                    council,
                    refresh_catalog,
                })
                .await?;
            println!(
                "sync complete: run_id={} sources={} succeeded={} timed_out={} failed={} inserted={} skipped={} reports={}",
                summary.run_id,
                summary.sources_attempted,
                summary.sources_succeeded,
                summary.sources_timed_out,
                summary.sources_hard_failed,
                summary.rows_inserted,
                summary.rows_skipped,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Catalog { refresh, json } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let build = pipeline.discover(refresh).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&build.catalog)?);
            } else {
                for entry in &build.catalog.councils {
                    println!("{} ({} csv)", entry.council, entry.csv_urls.len());
                }
                println!(
                    "{} councils, {} sources, built {} ({}; {} failed pages)",
                    build.catalog.councils.len(),
                    build.catalog.sources().count(),
                    build.catalog.built_at,
                    if build.from_cache { "cached" } else { "fresh" },
                    build.soft_failures
                );
            }
        }
        Commands::Anomalies {
            council,
            json,
            large_over,
            frequent_over,
        } => {
            let store = open_store(&config).await?;
            let detector = AnomalyDetector::with_thresholds(
                &store,
                AnomalyThresholds {
                    large_payment_gbp: large_over,
                    frequent_payments_per_month: frequent_over,
                    ..AnomalyThresholds::default()
                },
            );
            let report = AnomalyReport::run(&detector, council.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_anomalies(&report);
            }
        }
        Commands::Councils => {
            let pipeline = SyncPipeline::from_config(config).await?;
            println!("overrides:");
            for fetcher in pipeline.registry().overrides() {
                println!("  {} <- {}", fetcher.council(), fetcher.origin());
            }
            println!("stored:");
            for council in pipeline.store().councils().await? {
                let n = pipeline.store().count_payments(Some(&council)).await?;
                println!("  {council}: {n} payments");
            }
        }
        Commands::Report { runs } => {
            println!("{}", recent_briefs(&config.reports_dir, runs)?);
        }
        Commands::ServeScheduler => {
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = SyncPipeline::from_config(config).await?;
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.store().close().await;
        }
    }

    Ok(())
}

fn print_anomalies(report: &AnomalyReport) {
    if report.is_clean() {
        println!("no anomalies");
        return;
    }
    println!("large payments: {}", report.large_payments.len());
    for p in &report.large_payments {
        println!("  {} {} {} £{:.2}", p.council, p.payment_date, p.supplier, p.amount_gbp);
    }
    println!("frequent supplier-months: {}", report.frequent_payments.len());
    for f in &report.frequent_payments {
        println!("  {} {} {} x{} £{:.2}", f.council, f.month, f.supplier, f.payment_count, f.total_gbp);
    }
    println!("duplicate invoice refs: {}", report.duplicate_invoices.len());
    for d in &report.duplicate_invoices {
        println!("  {} {} x{} £{:.2}", d.council, d.invoice_ref, d.payment_count, d.total_gbp);
    }
    println!("missing invoice refs: {}", report.missing_invoices.len());
    println!("dominant suppliers: {}", report.supplier_dominance.len());
    for s in &report.supplier_dominance {
        println!("  {} {} {:.1}%", s.council, s.supplier, s.share_percent);
    }
}
