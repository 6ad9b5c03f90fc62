use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use evwatch_adapters::{build_fetcher, FetcherRegistry, HttpClient, SourceSettings};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

const MIN_FETCH_INTERVAL: Duration = Duration::from_secs(60);
const MAX_FETCH_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fetch interval {0:?} is outside the allowed range of 1 minute to 365 days")]
    FetchInterval(Duration),
    #[error("source fetch threshold must be positive")]
    SourceThreshold,
    #[error("http timeout must be positive")]
    HttpTimeout,
    #[error("{key}={value:?} is not a valid value")]
    Malformed { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub fetch_interval: Duration,
    /// Every Nth cycle is detailed; 0 disables detailed cycles.
    pub fetch_detailed_every: u32,
    pub source_fetch_threshold: Option<Duration>,
    pub scheduler_enabled: bool,
    pub outbox_dir: PathBuf,
    pub bind: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://evwatch.db".to_string(),
            fetch_interval: Duration::from_secs(24 * 60 * 60),
            fetch_detailed_every: 7,
            source_fetch_threshold: None,
            scheduler_enabled: true,
            outbox_dir: PathBuf::from("./outbox"),
            bind: "127.0.0.1:8080".to_string(),
            user_agent: "evwatch/0.1".to_string(),
            http_timeout_secs: 20,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { key, value: raw }),
    }
}

fn parsed_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Malformed { key, value: raw }),
        },
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unset keys keep their
    /// defaults; set but unparsable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            fetch_interval: parsed(&lookup, "EVWATCH_FETCH_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_interval),
            fetch_detailed_every: parsed(&lookup, "EVWATCH_FETCH_DETAILED_EVERY")?
                .unwrap_or(defaults.fetch_detailed_every),
            source_fetch_threshold: parsed(&lookup, "EVWATCH_SOURCE_THRESHOLD_SECS")?
                .map(Duration::from_secs),
            scheduler_enabled: parsed_flag(&lookup, "EVWATCH_SCHEDULER_ENABLED")?
                .unwrap_or(defaults.scheduler_enabled),
            outbox_dir: lookup("EVWATCH_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.outbox_dir),
            bind: lookup("EVWATCH_BIND").unwrap_or(defaults.bind),
            user_agent: lookup("EVWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed(&lookup, "EVWATCH_HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_timeout_secs),
            workspace_root: lookup("EVWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_interval < MIN_FETCH_INTERVAL || self.fetch_interval > MAX_FETCH_INTERVAL {
            return Err(ConfigError::FetchInterval(self.fetch_interval));
        }
        if self.source_fetch_threshold == Some(Duration::ZERO) {
            return Err(ConfigError::SourceThreshold);
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::HttpTimeout);
        }
        Ok(())
    }
}

/// Whether the cycle with zero-based index `run_index` is a detailed one.
pub fn is_detailed_run(run_index: u64, detailed_every: u32) -> bool {
    detailed_every > 0 && run_index % u64::from(detailed_every) == 0
}

/// Contents of `sources.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceSettings>,
}

impl SourceRegistry {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing sources registry")
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Builds one fetcher per listed source. Relative fixture paths resolve against `workspace_root`.
    pub fn build_fetchers(&self, workspace_root: &Path, http: &Arc<HttpClient>) -> Result<FetcherRegistry> {
        let mut registry = FetcherRegistry::new();
        for settings in &self.sources {
            let mut settings = settings.clone();
            if let Some(path) = settings.path.as_mut() {
                if path.is_relative() {
                    *path = workspace_root.join(&*path);
                }
            }
            let fetcher = build_fetcher(&settings, http)
                .with_context(|| format!("building fetcher for {}", settings.source))?;
            registry.register(fetcher);
        }
        Ok(registry)
    }
}
