//! Fetch, reconcile and notify pipeline plus its scheduler.

pub mod config;
pub mod delta;
pub mod gate;
pub mod pipeline;
pub mod queries;
pub mod reconcile;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use evwatch_adapters::{HttpClient, HttpClientConfig};
use evwatch_notify::{LogNotifier, Notifier, OutboxNotifier};
use evwatch_storage::{ItemStore, SqliteItemStore};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{is_detailed_run, ConfigError, SourceRegistry, SyncConfig};
pub use delta::{compute_delta, Delta};
pub use gate::{CycleGate, CycleGuard};
pub use pipeline::{CycleError, CycleReport, Pipeline, SourceReport, SourceStatus};
pub use queries::{load_saved_queries, parse_saved_query};
pub use reconcile::{reconcile, ReconcileOutcome};
pub use scheduler::{startup_delay, Scheduler};

pub const CRATE_NAME: &str = "evwatch-sync";

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<SqliteItemStore>> {
    let store = SqliteItemStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening store at {}", config.database_url))?;
    Ok(Arc::new(store))
}

/// Wires fetchers from `sources.yaml`, the notifier and `store` into a pipeline.
///
/// `dry_run` swaps the outbox for a notifier that only logs.
pub async fn build_pipeline(
    config: &SyncConfig,
    store: Arc<dyn ItemStore>,
    dry_run: bool,
) -> Result<Pipeline> {
    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let http = Arc::new(HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    let fetchers = registry.build_fetchers(&config.workspace_root, &http)?;
    info!(sources = fetchers.len(), enabled = fetchers.enabled().len(), "fetchers registered");

    let notifier: Arc<dyn Notifier> = if dry_run {
        Arc::new(LogNotifier)
    } else {
        Arc::new(OutboxNotifier::new(config.outbox_dir.clone()))
    };

    Ok(Pipeline::new(store, fetchers, notifier)
        .with_source_fetch_threshold(config.source_fetch_threshold))
}

/// Runs a single cycle with configuration from the environment.
pub async fn run_cycle_once_from_env(detailed: bool, dry_run: bool) -> Result<CycleReport> {
    let config = SyncConfig::from_env()?;
    config.validate()?;
    let store = connect_store(&config).await?;
    let pipeline = build_pipeline(&config, store, dry_run).await?;
    let report = pipeline
        .run_cycle(&CycleGate::new(), detailed, &CancellationToken::new())
        .await?;
    Ok(report)
}
