use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opcat_storage::{DocumentCollection, Filter, FindOptions, PgCollection, Sort};
use opcat_sync::{open_storage, report_daily_markdown, ExpirationSweep, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opcat-cli")]
#[command(about = "Opportunity catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization and print its summary.
    Sync,
    /// Deactivate listings whose end date has passed.
    Sweep,
    /// Query the catalog with a Mongo-style JSON filter.
    Find {
        #[arg(default_value = "{}")]
        filter: String,
        /// e.g. `dates.start_date:asc,title:desc`
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    Count {
        #[arg(default_value = "{}")]
        filter: String,
    },
    /// Summarize the latest run reports as markdown.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn parse_filter(text: &str) -> Result<Filter> {
    let value: serde_json::Value = serde_json::from_str(text).context("filter is not valid JSON")?;
    Ok(Filter::from_json(&value)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let report = pipeline.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("sync run failed: {}", report.error.unwrap_or_default());
            }
        }
        Commands::Sweep => {
            let storage = open_storage(&config)?;
            storage.refresh_backend().await;
            let swept = ExpirationSweep::new(&storage).run().await?;
            println!("{}", serde_json::to_string_pretty(&swept)?);
        }
        Commands::Find {
            filter,
            sort,
            page,
            limit,
        } => {
            let filter = parse_filter(&filter)?;
            let mut options = FindOptions {
                page,
                limit,
                ..FindOptions::default()
            };
            if let Some(sort) = sort {
                options = options.with_sort(Sort::parse(&sort)?);
            }
            let storage = open_storage(&config)?;
            storage.refresh_backend().await;
            let page = storage.find(&filter, &options).await?;
            info!(total = page.total, returned = page.items.len(), "query served");
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "total": page.total,
                    "items": page.items,
                }))?
            );
        }
        Commands::Count { filter } => {
            let filter = parse_filter(&filter)?;
            let storage = open_storage(&config)?;
            storage.refresh_backend().await;
            println!("{}", storage.count(&filter).await?);
        }
        Commands::Report { runs } => {
            println!("{}", report_daily_markdown(runs, &config.reports_root())?);
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL is not set");
            };
            let database = PgCollection::connect(url, config.collection.clone()).await?;
            database.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set OPCAT_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
