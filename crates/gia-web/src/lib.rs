//! JSON API over the aggregation service.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use gia_core::{JobFilter, JobKind, JobStatus, PageRequest, SourceName};
use gia_sync::{AggregationService, OrchestratorError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gia-web";

const DEFAULT_LIMIT: u32 = 20;
const MIN_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub service: AggregationService,
}

impl AppState {
    pub fn new(service: AggregationService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest {
    image_providers: Option<Vec<String>>,
}

// Raw strings so malformed numbers become our 400s rather than extractor rejections.
#[derive(Debug, Default, Deserialize)]
struct ListJobsQuery {
    page: Option<String>,
    limit: Option<String>,
    status: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs_handler).post(create_job_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/sources", get(sources_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("GIA_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let (config, _store, service) = gia_sync::build_service_from_env().await?;
    let scheduler = gia_sync::maybe_build_scheduler(&config, service.clone()).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, scheduler = scheduler.is_some(), "serving aggregation api");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "statusCode": status.as_u16(),
            "message": message.into(),
        })),
    )
        .into_response()
}

fn orchestrator_error(err: OrchestratorError) -> Response {
    match err {
        OrchestratorError::Conflict => error_body(StatusCode::CONFLICT, err.to_string()),
        OrchestratorError::UnknownSource(_) => error_body(StatusCode::BAD_REQUEST, err.to_string()),
        OrchestratorError::NotFound(_) => error_body(StatusCode::NOT_FOUND, err.to_string()),
        OrchestratorError::Store(_) => {
            error!(error = %err, "store failure while serving request");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

fn validate_providers(providers: &[String]) -> Result<(), String> {
    if providers.is_empty() {
        return Err("imageProviders must contain at least 1 element".to_string());
    }
    if let Some(unknown) = providers.iter().find(|p| p.parse::<SourceName>().is_err()) {
        return Err(format!(
            "imageProviders must contain only: {} (got {unknown})",
            SourceName::all_names().join(", ")
        ));
    }
    Ok(())
}

async fn create_job_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateJobRequest::default()
    } else {
        match serde_json::from_slice::<CreateJobRequest>(&body) {
            Ok(request) => request,
            Err(err) => return error_body(StatusCode::BAD_REQUEST, format!("invalid request body: {err}")),
        }
    };
    let providers = match request.image_providers {
        Some(providers) => {
            if let Err(message) = validate_providers(&providers) {
                return error_body(StatusCode::BAD_REQUEST, message);
            }
            providers
        }
        None => Vec::new(),
    };

    match state.service.start_job(JobKind::Manual, &providers).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(err) => orchestrator_error(err),
    }
}

fn parse_list_query(query: &ListJobsQuery) -> Result<(JobFilter, PageRequest), String> {
    let page = match query.page.as_deref() {
        None => 1,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|p| *p >= 1)
            .ok_or_else(|| "page must be an integer not less than 1".to_string())?,
    };
    let limit = match query.limit.as_deref() {
        None => DEFAULT_LIMIT,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|l| (MIN_LIMIT..=MAX_LIMIT).contains(l))
            .ok_or_else(|| format!("limit must be an integer between {MIN_LIMIT} and {MAX_LIMIT}"))?,
    };
    let status = query
        .status
        .as_deref()
        .map(|raw| raw.parse::<JobStatus>().map_err(|_| "status must be one of: running, finished".to_string()))
        .transpose()?;
    Ok((JobFilter { status }, PageRequest { page, limit }))
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListJobsQuery>) -> Response {
    let (filter, page) = match parse_list_query(&query) {
        Ok(parsed) => parsed,
        Err(message) => return error_body(StatusCode::BAD_REQUEST, message),
    };
    match state.service.list_jobs(&filter, page).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => orchestrator_error(err),
    }
}

async fn get_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<Uuid>() else {
        return error_body(StatusCode::BAD_REQUEST, "id must be a UUID");
    };
    match state.service.get_job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(err) => orchestrator_error(err),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "sources": state.service.supported_sources() })).into_response()
}
