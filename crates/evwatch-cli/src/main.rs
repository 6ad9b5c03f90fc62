use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evwatch_storage::ItemStore;
use evwatch_sync::{
    build_pipeline, connect_store, load_saved_queries, CycleGate, Scheduler, SyncConfig,
};
use evwatch_web::AppState;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "evwatch")]
#[command(about = "Watches event listings and mails saved-query updates")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scheduler plus web server until Ctrl-C (default).
    Run,
    /// One cycle, then exit.
    Once {
        #[arg(long)]
        detailed: bool,
        /// Log update emails instead of writing them to the outbox.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Web server only; cycles run via POST /api/trigger.
    Serve,
    /// Upsert saved queries from `*.sql` files in a directory.
    ImportQueries { dir: PathBuf },
    /// List saved queries and their recipients.
    Queries,
    /// Delete items that ended more than the retention period ago.
    Cleanup {
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal.cancel();
        }
    });
    token
}

async fn host(config: &SyncConfig, with_scheduler: bool) -> Result<()> {
    let store = connect_store(config).await?;
    let pipeline = Arc::new(build_pipeline(config, store, false).await?);
    let scheduler = Scheduler::from_config(Arc::clone(&pipeline), config);
    let shutdown = shutdown_on_ctrl_c();

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    let state = AppState::new(Arc::clone(&pipeline), scheduler.gate(), shutdown.clone());

    if with_scheduler {
        let (_, served) = tokio::join!(scheduler.run(shutdown.clone()), async {
            let served = evwatch_web::serve(listener, state).await;
            shutdown.cancel();
            served
        });
        served?;
    } else {
        evwatch_web::serve(listener, state).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if !config.scheduler_enabled {
                warn!("scheduler disabled by configuration; serving only");
            }
            host(&config, config.scheduler_enabled).await?;
        }
        Commands::Serve => host(&config, false).await?,
        Commands::Once { detailed, dry_run } => {
            let store = connect_store(&config).await?;
            let pipeline = build_pipeline(&config, store, dry_run).await?;
            let report = pipeline
                .run_cycle(&CycleGate::new(), detailed, &shutdown_on_ctrl_c())
                .await?;
            println!(
                "cycle complete: run_id={} new={} updated={} sent={} failed={}",
                report.run_id,
                report.new_items,
                report.updated_items,
                report.notifications_sent,
                report.notifications_failed
            );
            for source in &report.sources {
                println!(
                    "  {}: {:?} retrieved={} new={} updated={}",
                    source.source,
                    source.status,
                    source.items_retrieved,
                    source.new_items,
                    source.updated_items
                );
            }
        }
        Commands::Migrate => {
            connect_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::ImportQueries { dir } => {
            let store = connect_store(&config).await?;
            let queries = load_saved_queries(&dir).await?;
            for query in &queries {
                store
                    .upsert_saved_query(query)
                    .await
                    .with_context(|| format!("saving query {}", query.title))?;
                println!("imported {} ({} recipients)", query.title, query.recipients.len());
            }
            println!("{} saved queries imported from {}", queries.len(), dir.display());
        }
        Commands::Queries => {
            let store = connect_store(&config).await?;
            for query in store.list_saved_queries().await? {
                println!("{}: {}", query.title, query.recipients.join(", "));
            }
        }
        Commands::Cleanup { retention_days } => {
            let store = connect_store(&config).await?;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
            let deleted = store.delete_items_ended_before(cutoff).await?;
            println!("deleted {deleted} items that ended before {cutoff}");
        }
    }

    Ok(())
}
