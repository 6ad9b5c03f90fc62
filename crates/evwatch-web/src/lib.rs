//! Operator HTTP surface: status page, history listings and manual cycle trigger.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use evwatch_core::{FetchHistory, ItemSource, SavedQuery, SendUpdateHistory};
use evwatch_storage::{ItemStore, StoreError};
use evwatch_sync::{CycleError, CycleGate, CycleReport, Pipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const CRATE_NAME: &str = "evwatch-web";

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub gate: CycleGate,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, gate: CycleGate, shutdown: CancellationToken) -> Self {
        Self {
            pipeline,
            gate,
            shutdown,
        }
    }

    fn store(&self) -> &Arc<dyn ItemStore> {
        self.pipeline.store()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchHistoryView {
    pub source: ItemSource,
    pub execution_start: DateTime<Utc>,
    pub duration_ms: u64,
    pub items_retrieved: usize,
    pub new_items: usize,
    pub updated_items: usize,
    pub is_detailed: bool,
    pub succeeded: bool,
}

impl From<FetchHistory> for FetchHistoryView {
    fn from(row: FetchHistory) -> Self {
        Self {
            source: row.source,
            execution_start: row.execution_start,
            duration_ms: u64::try_from(row.execution_duration.as_millis()).unwrap_or(u64::MAX),
            items_retrieved: row.items_retrieved,
            new_items: row.new_items,
            updated_items: row.updated_items,
            is_detailed: row.is_detailed,
            succeeded: row.succeeded,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    #[serde(default)]
    detailed: bool,
}

#[derive(Template)]
#[template(path = "status.html")]
struct StatusTemplate {
    busy: bool,
    fetches: Vec<FetchHistoryView>,
    queries: Vec<SavedQuery>,
}

enum ApiError {
    Store(StoreError),
    Cycle(CycleError),
    Render(askama::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<CycleError> for ApiError {
    fn from(err: CycleError) -> Self {
        Self::Cycle(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Store(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::Cycle(CycleError::Cancelled) => {
                (StatusCode::SERVICE_UNAVAILABLE, CycleError::Cancelled.to_string())
            }
            ApiError::Cycle(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            ApiError::Render(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        error!(%status, %message, "request failed");
        (status, message).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(health_handler))
        .route("/api/fetch-history", get(fetch_history_handler))
        .route("/api/send-history", get(send_history_handler))
        .route("/api/queries", get(queries_handler))
        .route("/api/trigger", post(trigger_handler))
        .with_state(Arc::new(state))
}

/// Serves until `state.shutdown` fires.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, "web server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serving http")?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let fetches = state
        .store()
        .recent_fetch_history(20)
        .await?
        .into_iter()
        .map(FetchHistoryView::from)
        .collect();
    let queries = state.store().list_saved_queries().await?;
    let page = StatusTemplate {
        busy: state.gate.is_busy(),
        fetches,
        queries,
    };
    page.render().map(Html).map_err(ApiError::Render)
}

async fn fetch_history_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<FetchHistoryView>>, ApiError> {
    let rows = state.store().recent_fetch_history(q.limit()).await?;
    Ok(Json(rows.into_iter().map(FetchHistoryView::from).collect()))
}

async fn send_history_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<SendUpdateHistory>>, ApiError> {
    Ok(Json(state.store().recent_send_history(q.limit()).await?))
}

async fn queries_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SavedQuery>>, ApiError> {
    Ok(Json(state.store().list_saved_queries().await?))
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TriggerQuery>,
) -> Result<Json<CycleReport>, ApiError> {
    info!(detailed = q.detailed, "manual cycle requested");
    let report = state
        .pipeline
        .run_cycle(&state.gate, q.detailed, &state.shutdown)
        .await?;
    Ok(Json(report))
}
