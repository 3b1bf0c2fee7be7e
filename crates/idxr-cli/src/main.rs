use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use idxr_core::ListingQuery;
use idxr_feed::FeedRegistry;
use idxr_storage::{ListingStore, PgListingStore};
use idxr_sync::{
    load_pipeline, maybe_build_scheduler, RunOptions, SchedulerStats, SyncConfig, SyncRunSummary,
    SyncRunner, TriggerOutcome,
};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "idxr-cli")]
#[command(about = "IDX feed reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the feed directory into the listings table.
    Sync {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        fetch: bool,
    },
    /// Compute and report the change set without writing.
    Plan {
        #[arg(long)]
        force: bool,
    },
    Migrate,
    /// Download feed files that have a `download_url`.
    Fetch,
    /// Run the interval sync and daily cleanup until interrupted.
    Schedule {
        #[arg(long)]
        run_now: bool,
    },
    List(ListArgs),
    History,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    city: Option<String>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    min_price: Option<i64>,
    #[arg(long)]
    max_price: Option<i64>,
    #[arg(long)]
    min_bedrooms: Option<i64>,
    #[arg(long, default_value_t = 20)]
    limit: i64,
    #[arg(long, default_value_t = 0)]
    offset: i64,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "{:?}: run_id={} records={} create={} update={} mark_inactive={} held_back={} already_inactive={} reports={}",
        summary.status,
        summary.run_id,
        summary.parsed_records,
        summary.planned.create,
        summary.planned.update,
        summary.planned.mark_inactive,
        summary.held_back_inactive,
        summary.already_inactive,
        summary.reports_dir
    );
    for file in &summary.files {
        println!(
            "  {:<12} {:?} records={} dropped={}",
            file.file_name, file.status, file.records, file.dropped_rows
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        force: false,
        fetch: false,
    }) {
        Commands::Sync { force, fetch } => {
            let pipeline = load_pipeline(config).await?;
            let summary = pipeline
                .run(RunOptions {
                    dry_run: false,
                    force,
                    fetch,
                })
                .await?;
            print_summary(&summary);
        }
        Commands::Plan { force } => {
            let pipeline = load_pipeline(config).await?;
            let summary = pipeline
                .run(RunOptions {
                    dry_run: true,
                    force,
                    fetch: false,
                })
                .await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let store = PgListingStore::connect(&config.database_url)
                .await
                .context("connecting to listing database")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Fetch => {
            let registry = FeedRegistry::load(config.registry_path()).await?;
            let reports = idxr_sync::fetch_feeds(&config, &registry, Uuid::new_v4()).await?;
            for report in &reports {
                match &report.error {
                    Some(err) => println!("  {:<12} failed: {err}", report.file_name),
                    None => println!("  {:<12} {} bytes", report.file_name, report.bytes),
                }
            }
            println!("fetched {} of {} feeds", reports.iter().filter(|r| r.error.is_none()).count(), reports.len());
        }
        Commands::Schedule { run_now } => {
            let history_path = config.history_path();
            let runner = SyncRunner::new(load_pipeline(config.clone()).await?)
                .with_history(history_path)
                .await;
            let Some(mut sched) = maybe_build_scheduler(runner.clone(), &config).await? else {
                eprintln!("scheduler disabled; set IDX_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            if run_now {
                if let TriggerOutcome::Failed(err) = runner.trigger().await {
                    eprintln!("initial sync failed: {err}");
                }
            }
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::List(args) => {
            let registry = FeedRegistry::load(config.registry_path()).await?;
            let store = PgListingStore::connect(&config.database_url)
                .await
                .context("connecting to listing database")?;
            let listings = store
                .list_listings(&ListingQuery {
                    city: args.city,
                    status: args.status,
                    min_price: args.min_price,
                    max_price: args.max_price,
                    min_bedrooms: args.min_bedrooms,
                    priority_agent_id: registry.priority_agent_id,
                    limit: args.limit,
                    offset: args.offset,
                })
                .await
                .context("querying listings")?;
            for listing in &listings {
                let column = |name: &str| {
                    listing
                        .columns
                        .get(name)
                        .and_then(|v| v.as_deref())
                        .unwrap_or("-")
                        .to_string()
                };
                println!(
                    "{}  {:>10}  {:<8}  {} {}",
                    listing.listing_key,
                    column("list_price"),
                    column("listing_status"),
                    column("street_name"),
                    column("city")
                );
            }
        }
        Commands::History => {
            let stats = SchedulerStats::load(&config.history_path()).await?;
            println!(
                "runs={} ok={} failed={} coalesced={} avg_secs={:.1}",
                stats.total_runs,
                stats.successful_runs,
                stats.failed_runs,
                stats.coalesced_triggers,
                stats.average_duration_secs
            );
            for run in stats.run_history.iter().rev().take(10) {
                println!(
                    "  {} {} {:>6.1}s {} {} {}",
                    run.run_id,
                    run.started_at,
                    run.duration_secs,
                    if run.success { "ok" } else { "failed" },
                    run.reports_dir.as_deref().unwrap_or("-"),
                    run.error.as_deref().unwrap_or("")
                );
            }
        }
    }

    Ok(())
}
