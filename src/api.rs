use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::digest::model::{DigestFilter, DigestId, FeedId, FilterError};
use crate::digest::orchestrator::DigestProcessingOrchestrator;
use crate::digest::pipeline::DigestError;
use crate::digest::prompts::PromptOverrides;
use crate::metrics::Metrics;
use crate::scheduler::{CancelOutcome, SchedulerError};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DigestProcessingOrchestrator>,
    pub metrics: Option<Metrics>,
}

pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    let api = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/digests", post(queue_digest).get(list_digests))
        .route("/digests/generate", post(generate_digest))
        .route("/digests/{id}", get(get_digest).delete(delete_digest))
        .route("/digests/{id}/steps", get(get_steps))
        .route("/digests/{id}/progress", get(get_progress))
        .route("/digests/{id}/cancel", post(cancel_digest))
        .route("/queue", get(queue_status))
        .route("/feeds/info", get(feed_info))
        .layer(CorsLayer::very_permissive())
        .with_state(state);

    match metrics {
        Some(m) => api.merge(m.router()),
        None => api,
    }
}

// ---- request / response shapes ----

#[derive(Debug, Deserialize)]
pub struct DigestRequest {
    #[serde(default)]
    pub id: Option<DigestId>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    pub feeds: Vec<String>,
    #[serde(default)]
    pub prompt_overrides: PromptOverrides,
}

impl DigestRequest {
    /// Validate into a filter; no work is issued for a rejected request.
    pub fn into_filter(self, now: DateTime<Utc>) -> Result<(DigestId, DigestFilter), FilterError> {
        let feeds = self
            .feeds
            .iter()
            .map(|f| FeedId::parse(f))
            .collect::<Result<Vec<_>, _>>()?;
        let filter =
            DigestFilter::new_at(self.date_from, self.date_to, feeds, self.prompt_overrides, now)?;
        Ok((self.id.unwrap_or_default(), filter))
    }
}

#[derive(Serialize)]
struct Queued {
    id: DigestId,
}

#[derive(Serialize)]
struct QueueStatus {
    waiting: Vec<DigestId>,
    running: Vec<DigestId>,
    cancellation_requested: Vec<DigestId>,
}

#[derive(Serialize)]
struct CancelResp {
    id: DigestId,
    outcome: &'static str,
}

#[derive(Deserialize)]
struct FeedInfoQuery {
    url: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
    cause: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            cause: None,
        }
    }

    fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message, "cause": self.cause });
        (self.status, Json(body)).into_response()
    }
}

impl From<FilterError> for ApiError {
    fn from(e: FilterError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.body_text())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match e {
            SchedulerError::AlreadyQueued(_) => StatusCode::CONFLICT,
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<DigestError> for ApiError {
    fn from(e: DigestError) -> Self {
        let status = match &e {
            DigestError::Cancelled => StatusCode::CONFLICT,
            DigestError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DigestError::Feed { .. } | DigestError::Ai { .. } => StatusCode::BAD_GATEWAY,
        };
        Self {
            status,
            cause: e.cause(),
            message: e.to_string(),
        }
    }
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ---- handlers ----

async fn queue_digest(
    State(state): State<AppState>,
    payload: Result<Json<DigestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Queued>), ApiError> {
    let Json(req) = payload?;
    let (id, filter) = req.into_filter(Utc::now())?;
    state
        .orchestrator
        .queue_digest(id, filter, CancellationToken::new())?;
    Ok((StatusCode::ACCEPTED, Json(Queued { id })))
}

async fn generate_digest(
    State(state): State<AppState>,
    payload: Result<Json<DigestRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = payload?;
    let (id, filter) = req.into_filter(Utc::now())?;
    let orchestrator = state.orchestrator.clone();
    // Detached so a dropped connection cannot abandon the run halfway through its steps.
    let outcome = tokio::spawn(async move {
        orchestrator
            .process_digest(id, &filter, &CancellationToken::new())
            .await
    })
    .await
    .map_err(internal)??;
    Ok(Json(outcome).into_response())
}

async fn list_digests(State(state): State<AppState>) -> Result<Response, ApiError> {
    let list = state
        .orchestrator
        .repository()
        .list_digest_summaries()
        .await
        .map_err(internal)?;
    Ok(Json(list).into_response())
}

async fn get_digest(
    State(state): State<AppState>,
    Path(id): Path<DigestId>,
) -> Result<Response, ApiError> {
    match state
        .orchestrator
        .repository()
        .load_digest(id)
        .await
        .map_err(internal)?
    {
        Some(d) => Ok(Json(d).into_response()),
        None => Err(ApiError::not_found(format!("digest {id}"))),
    }
}

async fn delete_digest(
    State(state): State<AppState>,
    Path(id): Path<DigestId>,
) -> Result<StatusCode, ApiError> {
    if state
        .orchestrator
        .repository()
        .delete_digest(id)
        .await
        .map_err(internal)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("digest {id}")))
    }
}

async fn get_steps(
    State(state): State<AppState>,
    Path(id): Path<DigestId>,
) -> Result<Response, ApiError> {
    let steps = state.orchestrator.get_steps(id);
    if steps.is_empty() {
        return Err(ApiError::not_found(format!("digest {id}")));
    }
    Ok(Json(steps).into_response())
}

async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<DigestId>,
) -> Result<Response, ApiError> {
    state
        .orchestrator
        .progress(id)
        .map(|p| Json(p).into_response())
        .ok_or_else(|| ApiError::not_found(format!("digest {id}")))
}

async fn cancel_digest(
    State(state): State<AppState>,
    Path(id): Path<DigestId>,
) -> Result<(StatusCode, Json<CancelResp>), ApiError> {
    let outcome = match state.orchestrator.cancel(id)? {
        CancelOutcome::RemovedWaiting => "removed_waiting",
        CancelOutcome::CancellationRequested => "cancellation_requested",
    };
    Ok((StatusCode::ACCEPTED, Json(CancelResp { id, outcome })))
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    let o = &state.orchestrator;
    Json(QueueStatus {
        waiting: o.list_waiting(),
        running: o.list_running(),
        cancellation_requested: o.list_cancellation_requested(),
    })
}

async fn feed_info(
    State(state): State<AppState>,
    Query(q): Query<FeedInfoQuery>,
) -> Result<Response, ApiError> {
    let feed = FeedId::parse(&q.url)?;
    let info = state
        .orchestrator
        .fetch_feed_info(&feed)
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(info).into_response())
}
