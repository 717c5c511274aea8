//! HTTP trigger surfaces: record reads that piggyback a lazy sync, plus a
//! forced sync endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feedsync_core::StoredRecord;
use feedsync_storage::RecordStore;
use feedsync_sync::{maybe_build_scheduler, LazyTrigger, SyncError, SyncOrchestrator, SyncOutcome, SyncRuntime};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "feedsync-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub lazy: LazyTrigger,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        let lazy = LazyTrigger::new(Arc::clone(&orchestrator));
        Self {
            store,
            orchestrator,
            lazy,
        }
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self::new(Arc::clone(&runtime.store), Arc::clone(&runtime.orchestrator))
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecordsQuery {
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RecordsPage {
    page: usize,
    per_page: usize,
    records: Vec<StoredRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/records", get(records_handler))
        .route("/sync", post(sync_handler))
        .route("/sync/status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FEEDSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let runtime = SyncRuntime::from_env().await?;

    let scheduler = maybe_build_scheduler(&runtime.config, Arc::clone(&runtime.orchestrator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        tracing::info!(cron = %runtime.config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, app(AppState::from_runtime(&runtime))).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let fired = state.lazy.fire();
    tracing::trace!(?fired, "lazy sync trigger");

    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);
    let Some(offset) = (page - 1)
        .checked_mul(per_page)
        .filter(|offset| i64::try_from(*offset).is_ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, format!("page {page} out of range"));
    };

    match state.store.list_visible(per_page, offset).await {
        Ok(records) => Json(RecordsPage {
            page,
            per_page,
            records,
        })
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.run(true).await {
        Ok(SyncOutcome::Completed(result)) => Json(result).into_response(),
        Ok(outcome @ SyncOutcome::Skipped { .. }) => Json(outcome).into_response(),
        Err(err @ SyncError::FeedUnavailable(_)) => {
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.orchestrator.status()).into_response()
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
