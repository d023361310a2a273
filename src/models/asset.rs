//! Represents a finalized, immutable media asset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The durable record of a fully uploaded file.
///
/// Created exactly once when an upload session completes, with metadata
/// copied from the session and the storage key of the promoted object.
/// At most one asset exists per `(owner_id, content_hash)` pair when a
/// hash was declared.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Asset {
    /// Unique asset identifier, assigned at completion.
    pub id: Uuid,

    /// Principal that owns the asset.
    pub owner_id: Uuid,

    /// Original filename as declared at upload time.
    pub filename: String,

    /// Size in bytes.
    pub size: i64,

    /// Content type (MIME type), if declared.
    pub mime: Option<String>,

    /// Content hash declared at upload time; dedup key when present.
    pub content_hash: Option<String>,

    /// When the photo/video was captured, if declared.
    pub taken_at: Option<DateTime<Utc>>,

    /// Key of the object in durable storage.
    pub storage_key: String,

    /// When the asset was created.
    pub created_at: DateTime<Utc>,
}
