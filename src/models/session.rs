//! Represents an in-flight resumable upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// Only `Active` sessions accept chunk writes or completion; `Completed`
/// and `Aborted` are terminal and never transition again.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Server-side record of one in-progress resumable upload.
///
/// Everything except `uploaded_offset`, `status`, and `updated_at` is fixed
/// at creation time. Progress is advanced only by the chunk writer and the
/// status flipped only by completion or abort.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Unique session identifier, generated at creation.
    pub id: Uuid,

    /// Principal that initiated the upload.
    pub owner_id: Uuid,

    /// Client-declared filename of the finished file.
    pub filename: String,

    /// Content type (MIME type), if declared.
    pub mime: Option<String>,

    /// When the photo/video was captured, if declared.
    pub taken_at: Option<DateTime<Utc>>,

    /// Client-declared content hash, used for deduplication.
    pub content_hash: Option<String>,

    /// Declared byte length of the finished file.
    pub total_size: i64,

    /// Highest byte position proven written; monotonically non-decreasing.
    pub uploaded_offset: i64,

    /// Path of the staging scratch file; never reused by another session.
    pub staging_path: String,

    /// Current lifecycle state.
    pub status: SessionStatus,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// Last progress or state change; drives stale-session reaping.
    pub updated_at: DateTime<Utc>,
}
