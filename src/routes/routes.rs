//! Defines routes for the resumable upload API.
//!
//! ## Structure
//! - **Upload lifecycle**
//!   - `POST /upload/init`           — declare an upload (dedup-aware)
//!   - `POST /upload/chunk?id=&offset=` — stage one byte range (raw body)
//!   - `POST /upload/complete?id=`   — verify, promote, retire the session
//!   - `POST /upload/abort?id=`      — abandon a session
//!
//! - **Probes**
//!   - `GET /healthz` — liveness
//!   - `GET /readyz`  — readiness (DB + staging dir)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{abort_upload, complete_upload, init_upload, write_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // upload lifecycle
        .route("/upload/init", post(init_upload))
        .route("/upload/chunk", post(write_chunk))
        .route("/upload/complete", post(complete_upload))
        .route("/upload/abort", post(abort_upload))
}
