//! One fetch → reconcile → notify cycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use evwatch_adapters::{AdapterError, FetcherRegistry, SourceFetcher};
use evwatch_core::{FetchHistory, Item, ItemSource, SavedQuery, SendUpdateHistory};
use evwatch_notify::Notifier;
use evwatch_storage::{ItemStore, ReconciliationCommit, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::delta::compute_delta;
use crate::gate::CycleGate;
use crate::reconcile::reconcile;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cycle cancelled before reconciliation")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched,
    Failed,
    /// Skipped because the last successful fetch is within the source threshold.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: ItemSource,
    pub status: SourceStatus,
    pub items_retrieved: usize,
    pub new_items: usize,
    pub updated_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub detailed: bool,
    pub started_at: DateTime<Utc>,
    /// When reconciliation began, after the gate was acquired and fetching finished.
    pub reconcile_started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub new_items: usize,
    pub updated_items: usize,
    pub queries_evaluated: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
}

struct SourceFetch {
    history: FetchHistory,
    status: SourceStatus,
}

type FetchTask = JoinHandle<(Result<Vec<Item>, AdapterError>, Duration)>;

pub struct Pipeline {
    store: Arc<dyn ItemStore>,
    fetchers: FetcherRegistry,
    notifier: Arc<dyn Notifier>,
    source_fetch_threshold: Option<Duration>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn ItemStore>,
        fetchers: FetcherRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            fetchers,
            notifier,
            source_fetch_threshold: None,
        }
    }

    /// Skip sources whose last successful fetch started less than `threshold` ago.
    pub fn with_source_fetch_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.source_fetch_threshold = threshold;
        self
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    /// Runs one cycle while holding `gate`.
    ///
    /// Cancellation is honoured while waiting for the gate and during fetching.
    /// Once reconciliation starts the cycle runs to completion.
    pub async fn run_cycle(
        &self,
        gate: &CycleGate,
        detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CycleError::Cancelled),
            guard = gate.enter() => guard,
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id, detailed);
        self.run_locked(run_id, started_at, detailed, cancel)
            .instrument(span)
            .await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        info!("cycle started");

        let queries = self.store.list_saved_queries().await?;
        let mut before = Vec::with_capacity(queries.len());
        for query in &queries {
            before.push(self.snapshot(query).await);
        }

        let (fetched, mut fetches) = self.fetch_all(detailed, cancel).await?;

        let reconcile_started_at = Utc::now();
        let sources: Vec<ItemSource> = fetched
            .iter()
            .map(|item| item.source)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let existing = if sources.is_empty() {
            Vec::new()
        } else {
            self.store.items_for_sources(&sources).await?
        };
        let outcome = reconcile(fetched, existing);

        for fetch in &mut fetches {
            let source = fetch.history.source;
            if fetch.status == SourceStatus::Fetched {
                fetch.history.new_items = outcome.new_count(source);
                fetch.history.updated_items = outcome.updated_count(source);
            }
        }

        let commit = ReconciliationCommit {
            inserted: outcome.inserted,
            updated: outcome.updated,
            fetch_history: fetches
                .iter()
                .filter(|f| f.status != SourceStatus::Skipped)
                .map(|f| f.history.clone())
                .collect(),
        };
        self.store.commit_reconciliation(&commit).await?;
        info!(
            inserted = commit.inserted.len(),
            updated = commit.updated.len(),
            "reconciliation committed"
        );

        let mut report = CycleReport {
            run_id,
            detailed,
            started_at,
            reconcile_started_at,
            finished_at: reconcile_started_at,
            sources: fetches
                .iter()
                .map(|f| SourceReport {
                    source: f.history.source,
                    status: f.status,
                    items_retrieved: f.history.items_retrieved,
                    new_items: f.history.new_items,
                    updated_items: f.history.updated_items,
                })
                .collect(),
            new_items: commit.inserted.len(),
            updated_items: commit.updated.len(),
            queries_evaluated: 0,
            notifications_sent: 0,
            notifications_failed: 0,
        };

        for (query, before) in queries.iter().zip(before) {
            let Some(before) = before else { continue };
            self.notify_query(query, &before, &mut report)
                .instrument(info_span!("query", title = %query.title))
                .await;
        }

        report.finished_at = Utc::now();
        info!(
            new_items = report.new_items,
            updated_items = report.updated_items,
            sent = report.notifications_sent,
            failed = report.notifications_failed,
            "cycle finished"
        );
        Ok(report)
    }

    async fn snapshot(&self, query: &SavedQuery) -> Option<Vec<Item>> {
        match self.store.execute_query(&query.query_text).await {
            Ok(items) => Some(items),
            Err(err) => {
                error!(title = %query.title, error = %err, "saved query failed; skipping it this cycle");
                None
            }
        }
    }

    async fn fetch_all(
        &self,
        detailed: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Item>, Vec<SourceFetch>), CycleError> {
        let mut fetches = Vec::new();
        let mut tasks: Vec<(usize, FetchTask)> = Vec::new();

        for (source, fetcher) in self.fetchers.enabled() {
            let history = FetchHistory::started(source, Utc::now(), detailed);

            if self.within_threshold(source).await? {
                info!(%source, "fetched recently; skipping source");
                fetches.push(SourceFetch {
                    history,
                    status: SourceStatus::Skipped,
                });
                continue;
            }

            let existing = match self.store.items_for_sources(&[source]).await {
                Ok(items) => items,
                Err(err) => {
                    error!(%source, error = %err, "loading stored items failed");
                    fetches.push(SourceFetch {
                        history,
                        status: SourceStatus::Failed,
                    });
                    continue;
                }
            };

            tasks.push((fetches.len(), spawn_fetch(fetcher, existing, detailed, cancel.clone())));
            fetches.push(SourceFetch {
                history,
                status: SourceStatus::Failed,
            });
        }

        let mut items = Vec::new();
        for (idx, task) in tasks {
            let fetch = &mut fetches[idx];
            let source = fetch.history.source;
            match task.await {
                Ok((Ok(fetched), elapsed)) => {
                    info!(%source, items = fetched.len(), elapsed_ms = elapsed.as_millis() as u64, "source fetched");
                    fetch.history.execution_duration = elapsed;
                    fetch.history.items_retrieved = fetched.len();
                    fetch.history.succeeded = true;
                    fetch.status = SourceStatus::Fetched;
                    items.extend(fetched);
                }
                Ok((Err(AdapterError::Cancelled), elapsed)) => {
                    warn!(%source, "fetch cancelled");
                    fetch.history.execution_duration = elapsed;
                }
                Ok((Err(err), elapsed)) => {
                    error!(%source, error = %err, "fetch failed");
                    fetch.history.execution_duration = elapsed;
                }
                Err(err) => {
                    error!(%source, error = %err, "fetch task aborted");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        Ok((items, fetches))
    }

    async fn within_threshold(&self, source: ItemSource) -> Result<bool, StoreError> {
        let Some(threshold) = self.source_fetch_threshold else {
            return Ok(false);
        };
        let Some(last) = self.store.last_successful_fetch_started_at(source).await? else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(last);
        Ok(age.to_std().map(|age| age < threshold).unwrap_or(true))
    }

    async fn notify_query(&self, query: &SavedQuery, before: &[Item], report: &mut CycleReport) {
        let after = match self.store.execute_query(&query.query_text).await {
            Ok(items) => items,
            Err(err) => {
                error!(error = %err, "saved query failed after reconciliation");
                return;
            }
        };
        report.queries_evaluated += 1;

        let first_notification = match self.store.has_send_history(&query.title, &query.recipients).await {
            Ok(sent_before) => !sent_before,
            Err(err) => {
                error!(error = %err, "reading send history failed");
                return;
            }
        };

        let delta = compute_delta(before, &after, first_notification);
        if delta.is_empty() {
            info!("no changes for query");
            return;
        }

        for recipient in &query.recipients {
            let sent = self
                .notifier
                .send_update(recipient, &query.title, &delta.new_items, &delta.updated_items)
                .await;
            if let Err(err) = sent {
                error!(recipient = %recipient, error = %err, "update delivery failed");
                report.notifications_failed += 1;
                continue;
            }

            let row = SendUpdateHistory {
                query_title: query.title.clone(),
                recipient_address: recipient.clone(),
                sent_at: Utc::now(),
                new_items_count: delta.new_items.len(),
                updated_items_count: delta.updated_items.len(),
            };
            match self.store.append_send_history(&row).await {
                Ok(()) => report.notifications_sent += 1,
                Err(err) => {
                    error!(recipient = %recipient, error = %err, "recording send history failed");
                    report.notifications_failed += 1;
                }
            }
        }
        info!(
            new_items = delta.new_items.len(),
            updated_items = delta.updated_items.len(),
            recipients = query.recipients.len(),
            "query notified"
        );
    }
}

fn spawn_fetch(
    fetcher: Arc<dyn SourceFetcher>,
    existing: Vec<Item>,
    detailed: bool,
    cancel: CancellationToken,
) -> FetchTask {
    let span = info_span!("fetch", source = %fetcher.source());
    tokio::spawn(
        async move {
            let started = Instant::now();
            let result = fetcher.fetch(&existing, detailed, &cancel).await;
            (result, started.elapsed())
        }
        .instrument(span),
    )
}
