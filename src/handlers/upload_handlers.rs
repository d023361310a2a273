//! HTTP handlers for the resumable upload lifecycle.
//!
//! The caller's identity arrives as an `x-user-id` header, populated by the
//! auth layer in front of this service, and is passed down as an explicit
//! parameter — never read from ambient state. Chunk payloads are raw request
//! bodies addressed by `?id=&offset=` query parameters.

use crate::{
    errors::AppError,
    services::upload_service::{CompleteOutcome, InitiateOutcome, NewUpload, UploadService},
};
use axum::{
    Json,
    body::Bytes,
    extract::{FromRequestParts, Query, State},
    http::{StatusCode, request::Parts},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

/// Identity of the uploading principal, taken from the `x-user-id` header.
pub struct OwnerId(pub Uuid);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing x-user-id header"))?;
        let id = Uuid::parse_str(raw)
            .map_err(|_| AppError::new(StatusCode::UNAUTHORIZED, "malformed x-user-id header"))?;
        Ok(OwnerId(id))
    }
}

/// Request body for `POST /upload/init`.
#[derive(Debug, Deserialize)]
pub struct InitUploadReq {
    pub filename: String,
    pub size: i64,
    pub mime: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub hash: Option<String>,
}

/// Query params for `POST /upload/chunk`.
#[derive(Debug, Deserialize)]
pub struct ChunkQuery {
    pub id: Uuid,
    pub offset: i64,
}

/// Query params for `POST /upload/complete` and `POST /upload/abort`.
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub id: Uuid,
}

/// `POST /upload/init` — declare an upload; answers with either the
/// deduplicated existing asset or a fresh session starting at offset 0.
pub async fn init_upload(
    State(service): State<UploadService>,
    owner: OwnerId,
    Json(req): Json<InitUploadReq>,
) -> Result<Json<Value>, AppError> {
    let outcome = service
        .initiate_upload(
            owner.0,
            NewUpload {
                filename: req.filename,
                size: req.size,
                mime: req.mime,
                taken_at: req.taken_at,
                content_hash: req.hash,
            },
        )
        .await?;

    let body = match outcome {
        InitiateOutcome::Exists { asset_id } => json!({
            "status": "exists",
            "asset_id": asset_id,
        }),
        InitiateOutcome::Started { session_id } => json!({
            "upload_id": session_id,
            "offset": 0,
        }),
    };
    Ok(Json(body))
}

/// `POST /upload/chunk?id=&offset=` — stage one byte range. The returned
/// `offset` is the post-write progress marker, so the client can resume
/// without a separate status call.
pub async fn write_chunk(
    State(service): State<UploadService>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let received = body.len();
    let offset = service.write_chunk(query.id, query.offset, &body).await?;
    Ok(Json(json!({
        "received": received,
        "offset": offset,
    })))
}

/// `POST /upload/complete?id=` — verify, promote, and retire the session.
/// Safe to retry until it returns `completed`.
pub async fn complete_upload(
    State(service): State<UploadService>,
    owner: OwnerId,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, AppError> {
    let outcome = service.complete_upload(owner.0, query.id).await?;
    let asset_id = match outcome {
        CompleteOutcome::Completed { asset_id } => asset_id,
        CompleteOutcome::Deduplicated { asset_id } => asset_id,
    };
    Ok(Json(json!({
        "status": "completed",
        "asset_id": asset_id,
    })))
}

/// `POST /upload/abort?id=` — abandon a session and release its staging
/// file. Idempotent.
pub async fn abort_upload(
    State(service): State<UploadService>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<Value>, AppError> {
    service.abort_session(query.id).await?;
    Ok(Json(json!({ "status": "aborted" })))
}
