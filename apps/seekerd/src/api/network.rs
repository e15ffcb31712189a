//! Relay endpoints: agent-to-controller file and share-index uploads.
//!
//! Both endpoints take streamed multipart bodies. The `credential` part
//! must come first so requests can be rejected before any payload bytes
//! are accepted; file bodies are forwarded chunk by chunk and never
//! buffered in memory.

use axum::{
    extract::{Multipart, Path, State},
    routing::post,
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files/:agent/:id", post(receive_file))
        .route("/shares/:agent/:id", post(receive_shares))
}

/// POST /api/v0/network/files/:agent/:id
///
/// An agent answering `REQUEST_FILE`. The handler hands the body stream to
/// the waiting upload and returns only after the upload reports
/// end-of-transfer, so the request stays open exactly as long as the body
/// is needed.
async fn receive_file(
    State(state): State<AppState>,
    Path((agent, id)): Path<(String, Uuid)>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let hub = state
        .relay
        .as_ref()
        .ok_or_else(|| AppError::NotFound("relay is not enabled".to_string()))?;

    let credential = read_credential(&mut multipart).await?;
    let intake = hub.claim_file(&agent, id, &credential)?;

    let mut field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?
        .ok_or_else(|| AppError::BadRequest("missing file part".to_string()))?;
    if field.name() != Some("file") {
        return Err(AppError::BadRequest(
            "second multipart part must be the file".to_string(),
        ));
    }

    let mut forwarded: u64 = 0;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                forwarded += chunk.len() as u64;
                if intake.bytes.send(Ok(chunk)).await.is_err() {
                    // The upload is no longer consuming; drain no further.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = intake
                    .bytes
                    .send(Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e.to_string(),
                    )))
                    .await;
                return Err(AppError::TransportFailure(format!(
                    "file body interrupted: {}",
                    e
                )));
            }
        }
    }
    drop(intake.bytes);

    // Block until the orchestrator reports end-of-transfer.
    let _ = intake.completion.await;

    tracing::debug!(id = %id, agent = %agent, bytes = forwarded, "Relayed file received");
    Ok(Json(json!({ "id": id, "bytes": forwarded })))
}

/// POST /api/v0/network/shares/:agent/:id
///
/// An agent shipping its share index slice: credential, a JSON description
/// of its shares, and the index database as a file.
async fn receive_shares(
    State(state): State<AppState>,
    Path((agent, id)): Path<(String, Uuid)>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let hub = state
        .relay
        .as_ref()
        .ok_or_else(|| AppError::NotFound("relay is not enabled".to_string()))?;

    let credential = read_credential(&mut multipart).await?;
    hub.verify_share_upload(&agent, id, &credential)?;

    let mut description: Option<serde_json::Value> = None;
    let mut database: Option<std::path::PathBuf> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?
    {
        match field.name() {
            Some("shares") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("unreadable shares part: {}", e)))?;
                description = Some(serde_json::from_str(&text).map_err(|e| {
                    AppError::BadRequest(format!("invalid shares description: {}", e))
                })?);
            }
            Some("database") => {
                let staging =
                    std::env::temp_dir().join(format!("seekerd-upload-{}.db", id.as_simple()));
                let mut file = tokio::fs::File::create(&staging).await?;
                loop {
                    match field.chunk().await {
                        Ok(Some(chunk)) => {
                            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            drop(file);
                            let _ = tokio::fs::remove_file(&staging).await;
                            return Err(AppError::TransportFailure(format!(
                                "database body interrupted: {}",
                                e
                            )));
                        }
                    }
                }
                tokio::io::AsyncWriteExt::flush(&mut file).await?;
                database = Some(staging);
            }
            other => {
                tracing::debug!(part = ?other, "Ignoring unexpected multipart part");
            }
        }
    }

    let database = database
        .ok_or_else(|| AppError::BadRequest("missing database part".to_string()))?;
    if let Some(description) = &description {
        tracing::debug!(agent = %agent, shares = %description, "Share description received");
    }

    let swapped = state.shares.replace_remote_slice(&agent, &database).await;
    let _ = tokio::fs::remove_file(&database).await;
    swapped?;

    let (files, directories) = state.shares.totals().await;
    Ok(Json(json!({
        "id": id,
        "agent": agent,
        "files": files,
        "directories": directories,
    })))
}

/// The credential section must be the first multipart part.
async fn read_credential(multipart: &mut Multipart) -> Result<String> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?
        .ok_or_else(|| AppError::BadRequest("missing credential part".to_string()))?;
    if field.name() != Some("credential") {
        return Err(AppError::BadRequest(
            "first multipart part must be the credential".to_string(),
        ));
    }
    field
        .text()
        .await
        .map_err(|e| AppError::BadRequest(format!("unreadable credential part: {}", e)))
}
