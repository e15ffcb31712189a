//! Transfer endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::services::transfers::{TransferDirection, TransferRecord};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/downloads", get(list_downloads).post(enqueue_downloads))
        .route("/uploads", get(list_uploads))
        .route("/downloads/all/completed", delete(clear_downloads))
        .route("/uploads/all/completed", delete(clear_uploads))
        .route("/downloads/:id", get(get_transfer).delete(delete_transfer))
        .route("/uploads/:id", get(get_transfer).delete(delete_transfer))
        .route("/downloads/:id/position", get(download_position))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    /// Include records hidden by remove.
    #[serde(default)]
    include_removed: bool,
}

async fn list_downloads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransferRecord>>> {
    let records = state
        .orchestrator
        .list(TransferDirection::Download, query.include_removed)
        .await?;
    Ok(Json(records))
}

async fn list_uploads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransferRecord>>> {
    let records = state
        .orchestrator
        .list(TransferDirection::Upload, query.include_removed)
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
struct EnqueueFile {
    filename: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    username: String,
    files: Vec<EnqueueFile>,
}

/// POST /api/v0/transfers/downloads
async fn enqueue_downloads(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<Vec<Uuid>>)> {
    if request.files.is_empty() {
        return Err(AppError::BadRequest("no files requested".to_string()));
    }
    let files: Vec<(String, u64)> = request
        .files
        .into_iter()
        .map(|f| (f.filename, f.size))
        .collect();
    let ids = state
        .orchestrator
        .enqueue_downloads(&request.username, &files)
        .await?;
    Ok((StatusCode::CREATED, Json(ids)))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TransferRecord>> {
    let record = state
        .orchestrator
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("transfer {}", id)))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    /// Also hide the record from default views.
    #[serde(default)]
    remove: bool,
}

/// DELETE /api/v0/transfers/{downloads|uploads}/:id
///
/// Cancels the transfer; with `?remove=true` also removes the record.
async fn delete_transfer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> Result<StatusCode> {
    if query.remove {
        state.orchestrator.remove(id).await?;
    } else {
        state.orchestrator.cancel(id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn download_position(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<u32>> {
    let position = state.orchestrator.download_position(id).await?;
    Ok(Json(position))
}

async fn clear_downloads(State(state): State<AppState>) -> Result<StatusCode> {
    state
        .orchestrator
        .clear_completed(TransferDirection::Download)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_uploads(State(state): State<AppState>) -> Result<StatusCode> {
    state
        .orchestrator
        .clear_completed(TransferDirection::Upload)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
