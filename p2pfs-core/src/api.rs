//! REST API for the running node

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::blockexc::{ExchangeEngine, ExchangeError};
use crate::content_id::parse_cid_str;
use crate::dag::{list_links, node_payload};
use crate::importer::{import_bytes, ImportError};
use crate::storage::StorageError;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ExchangeEngine>,
    pub peer_id: String,
}

#[derive(Serialize, Deserialize)]
pub struct AddResponse {
    pub cid: String,
    pub size: usize,
}

#[derive(Deserialize)]
pub struct AddParams {
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct LinkEntry {
    pub name: String,
    pub cid: String,
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
pub struct PinResponse {
    pub cid: String,
    pub announced: bool,
}

/// Health check response
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub peer_id: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Create the REST API router
pub fn create_router(engine: Arc<ExchangeEngine>) -> Router {
    let state = ApiState {
        peer_id: engine.local_peer().to_string(),
        engine,
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v0/add", post(add))
        .route("/api/v0/files", get(files))
        .route("/api/v0/cat/:cid", get(cat))
        .route("/api/v0/fetch/:cid", get(fetch))
        .route("/api/v0/ls/:cid", get(ls))
        .route("/api/v0/pin/:cid", post(pin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        peer_id: state.peer_id,
    })
}

async fn add(
    State(state): State<ApiState>,
    Query(params): Query<AddParams>,
    body: bytes::Bytes,
) -> Result<Json<AddResponse>, ApiError> {
    let size = body.len();
    let store = state.engine.store();
    let cid = import_bytes(body.to_vec(), store).await?;

    if let Some(name) = params.name.filter(|n| !n.is_empty()) {
        store.record_shared(&name, &cid).await?;
    }
    state.engine.provide_block(cid);

    info!("API: Added {} ({} bytes)", cid, size);
    Ok(Json(AddResponse {
        cid: cid.to_string(),
        size,
    }))
}

async fn files(State(state): State<ApiState>) -> Result<Json<BTreeMap<String, String>>, ApiError> {
    let shared = state.engine.store().shared_files().await?;
    Ok(Json(
        shared
            .into_iter()
            .map(|(name, cid)| (name, cid.to_string()))
            .collect(),
    ))
}

/// File content from the local store only
async fn cat(State(state): State<ApiState>, Path(cid_str): Path<String>) -> Result<Response, ApiError> {
    let cid = parse_cid_str(&cid_str)?;
    let block = state.engine.store().get(&cid).await?;
    let data = node_payload(&block).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(octet_stream(data))
}

/// File content, fetched from peers if needed
async fn fetch(State(state): State<ApiState>, Path(cid_str): Path<String>) -> Result<Response, ApiError> {
    let cid = parse_cid_str(&cid_str)?;
    let block = state.engine.get_block(&cid).await?;
    let data = node_payload(&block).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(octet_stream(data))
}

async fn ls(
    State(state): State<ApiState>,
    Path(cid_str): Path<String>,
) -> Result<Json<Vec<LinkEntry>>, ApiError> {
    let cid = parse_cid_str(&cid_str)?;
    let block = state.engine.store().get(&cid).await?;

    Ok(Json(
        list_links(&block)
            .into_iter()
            .map(|link| LinkEntry {
                name: link.name,
                cid: link.cid.to_string(),
                size: link.size,
            })
            .collect(),
    ))
}

async fn pin(State(state): State<ApiState>, Path(cid_str): Path<String>) -> Result<Json<PinResponse>, ApiError> {
    let cid = parse_cid_str(&cid_str)?;
    if !state.engine.store().has(&cid).await? {
        return Err(ApiError::NotFound(cid_str));
    }

    state.engine.provide_block(cid);
    Ok(Json(PinResponse {
        cid: cid.to_string(),
        announced: true,
    }))
}

fn octet_stream(data: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response()
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<crate::content_id::CidError> for ApiError {
    fn from(e: crate::content_id::CidError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::BlockNotFound(cid) => ApiError::NotFound(cid),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        match e {
            ImportError::Storage(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ExchangeError> for ApiError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::NotFound { cid, .. } | ExchangeError::DeadlineExceeded { cid, .. } => {
                ApiError::NotFound(cid.to_string())
            }
            ExchangeError::Storage(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(cid) => (StatusCode::NOT_FOUND, format!("Block not found: {}", cid)),
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
