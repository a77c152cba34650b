//! HTTP REST API for callers.
//!
//! Every handler shares one [`AppState`]. Worker calls go through the
//! broker; multi-target runs go through a per-request orchestrator bound
//! to the named worker.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pagerelay::events::event_matches_url;
use pagerelay::records::{RecordLog, ReportRecord, ShuffleRecord};
use pagerelay::{
    BrokerPageSource, CallError, DedupLedger, Materializer, Orchestrator, RunReport, RunRequest,
    TaggedItem,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::materializer::saved_ids;
use crate::state::AppState;
use crate::transport::ws_handler;

/// Largest accepted request body.
const BODY_LIMIT: usize = 50 * 1024 * 1024;

/// Build the axum Router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/ws", get(ws_handler))
        .route("/events", get(events_sse))
        .route("/call", post(handle_call))
        .route("/fetch", post(handle_fetch))
        .route("/download", post(handle_download))
        .route("/check-saved", post(handle_check_saved))
        .route("/saved-list", get(handle_saved_list))
        .route("/save-shuffled-urls", post(handle_save_shuffled))
        .route("/save-ig-user-stories-report", post(handle_save_report))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(cors)
        .with_state(state)
}

fn required(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

// ── Worker calls ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CallBody {
    id: Option<String>,
    apiname: Option<String>,
    #[serde(default)]
    apiparams: Value,
}

/// Relay one call to a worker and return its raw result.
///
/// A worker-reported error is a successful relay: it comes back as
/// `{"result": null, "error": ...}` with status 200.
async fn handle_call(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CallBody>,
) -> Result<Json<Value>, ApiError> {
    let (Some(id), Some(apiname)) = (required(body.id), required(body.apiname)) else {
        return Err(ApiError::BadRequest("Missing required parameters".into()));
    };

    tracing::info!("Call {apiname} on {id}");
    match state.broker.call(&id, &apiname, body.apiparams).await {
        Ok(result) => Ok(Json(json!({ "result": result }))),
        Err(CallError::WorkerReportedError(msg)) if msg != pagerelay::broker::DISPATCH_FAILURE => {
            Ok(Json(json!({ "result": null, "error": msg })))
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
struct FetchBody {
    id: Option<String>,
    apiname: Option<String>,
    #[serde(default)]
    apiparams: Map<String, Value>,
    #[serde(default)]
    materialize: bool,
}

/// Run every target in `apiparams.url` against one worker.
async fn handle_fetch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FetchBody>,
) -> Result<Json<RunReport>, ApiError> {
    let (Some(id), Some(apiname)) = (required(body.id), required(body.apiname)) else {
        return Err(ApiError::BadRequest("Missing required parameters".into()));
    };
    if state.registry.lookup(&id).is_none() {
        return Err(CallError::WorkerUnavailable(id).into());
    }

    let source = Arc::new(BrokerPageSource::new(Arc::clone(&state.broker), id));
    let orchestrator = Orchestrator::new(
        source,
        state.ledger.clone(),
        state.store.clone(),
        state.config.clone(),
    )
    .with_events(Arc::clone(&state.events))
    .with_materializer(state.materializer.clone());

    let report = orchestrator
        .run(RunRequest {
            api_name: apiname,
            params: body.apiparams,
            materialize: body.materialize,
        })
        .await?;
    Ok(Json(report))
}

// ── Materialization ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DownloadBody {
    results: Option<Vec<Value>>,
    #[serde(rename = "apiName", default)]
    api_name: Option<String>,
}

/// Download media for already-tagged items.
async fn handle_download(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DownloadBody>,
) -> Result<Response, ApiError> {
    let Some(results) = body.results else {
        return Err(ApiError::BadRequest("Invalid data received".into()));
    };
    let api_name = body.api_name.unwrap_or_default();
    tracing::info!(
        "Received download request for {} items. API: {api_name}",
        results.len()
    );

    let items: Vec<TaggedItem> = results.into_iter().map(TaggedItem::from_value).collect();
    let summary = state
        .materializer
        .materialize(&api_name, &items, state.ledger.as_ref())
        .await?;

    let response = if summary.is_clean() {
        (
            StatusCode::OK,
            Json(json!({ "message": format!("Downloaded {} files.", summary.downloaded) })),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!(
                    "Finished with {} errors. Downloaded {} files. Check server logs for details.",
                    summary.errors.len(),
                    summary.downloaded
                )
            })),
        )
    };
    Ok(response.into_response())
}

#[derive(Debug, Deserialize)]
struct CheckSavedBody {
    username: Option<String>,
    ids: Option<Vec<Value>>,
}

/// Which of `ids` already have a media file for `username` on disk.
async fn handle_check_saved(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckSavedBody>,
) -> Result<Json<Value>, ApiError> {
    let (Some(username), Some(ids)) = (required(body.username), body.ids) else {
        return Err(ApiError::BadRequest("Missing username or ids".into()));
    };
    let ids: Vec<String> = ids.iter().filter_map(pagerelay::value_as_id).collect();
    Ok(Json(json!({ "saved": saved_ids(&state.data_dir, &username, &ids) })))
}

async fn handle_saved_list(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "list": state.ledger.entries() }))
}

// ── Caller-supplied records ─────────────────────────────────────

/// Append a shuffled order computed by the caller.
async fn handle_save_shuffled(
    State(state): State<Arc<AppState>>,
    Json(record): Json<ShuffleRecord>,
) -> Result<Json<Value>, ApiError> {
    if record.api_name.is_empty() || record.timestamp.is_empty() {
        return Err(ApiError::BadRequest("Missing apiName, urls, or timestamp".into()));
    }
    let path = state.store.shuffle_path(&record.api_name)?;
    RecordLog::open(path)
        .and_then(|log| log.append(&record))
        .map_err(|e| {
            tracing::error!("Error saving shuffled URLs: {e}");
            ApiError::Internal("Failed to save shuffled URLs".into())
        })?;
    Ok(Json(json!({ "message": "Shuffled URLs saved." })))
}

/// Append a report computed by the caller.
async fn handle_save_report(
    State(state): State<Arc<AppState>>,
    Json(record): Json<ReportRecord<Value>>,
) -> Result<Json<Value>, ApiError> {
    if record.api_name.is_empty() || record.timestamp.is_empty() {
        return Err(ApiError::BadRequest("Missing apiName, report, or timestamp".into()));
    }
    RecordLog::open(state.store.reports_path())
        .and_then(|log| log.append(&record))
        .map_err(|e| {
            tracing::error!("Error saving report: {e}");
            ApiError::Internal("Failed to save report".into())
        })?;
    Ok(Json(json!({ "message": "Report saved." })))
}

// ── Observability ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventsParams {
    url: Option<String>,
}

/// Server-Sent Events endpoint streaming relay events.
///
/// Optionally filters target events by `?url=...`.
async fn events_sse(
    Query(params): Query<EventsParams>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.events.subscribe();
    let url_filter = params.url;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(ref url) = url_filter {
                        if !event_matches_url(&event, url) {
                            continue;
                        }
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "workers": state.registry.identities(),
        "in_flight": state.broker.in_flight(),
    }))
}
