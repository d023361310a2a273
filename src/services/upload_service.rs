//! src/services/upload_service.rs
//!
//! UploadService — the resumable-upload core: session creation with
//! content-hash dedup, random-offset chunk staging with a monotonic
//! progress marker, and completion (verify, promote to durable storage,
//! create the asset record, retire the session).
//!
//! SQLite is the source of truth for session and asset state; the session
//! row is re-fetched inside the per-session lock on every mutating
//! operation rather than cached across requests.

use crate::models::session::{SessionStatus, UploadSession};
use crate::services::{object_store::ObjectStore, staging::StagingArea};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io,
    path::Path,
    sync::Arc,
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt, sync::Mutex};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at asset-record creation before a completion gives up and
/// leaves the session `active` for a client retry.
const ASSET_CREATE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session `{id}` is {status}")]
    SessionNotActive { id: Uuid, status: SessionStatus },
    #[error("range [{offset}, {offset}+{len}) is outside the declared size {total_size}")]
    InvalidRange {
        offset: i64,
        len: usize,
        total_size: i64,
    },
    #[error("upload incomplete: staged {staged} of {expected} bytes")]
    UploadIncomplete { staged: i64, expected: i64 },
    #[error("content hash mismatch: declared {declared}, staged content is {computed}")]
    ChecksumMismatch { declared: String, computed: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Client-declared metadata for a new upload.
#[derive(Clone, Debug)]
pub struct NewUpload {
    pub filename: String,
    pub size: i64,
    pub mime: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

/// Result of `initiate_upload`.
#[derive(Debug)]
pub enum InitiateOutcome {
    /// Content with this hash already exists for the owner; nothing was
    /// allocated. Repeating the initiate is idempotent.
    Exists { asset_id: Uuid },
    /// A fresh session was created; chunks start at offset 0.
    Started { session_id: Uuid },
}

/// Result of `complete_upload`.
#[derive(Debug)]
pub enum CompleteOutcome {
    /// The asset record was created by this completion.
    Completed { asset_id: Uuid },
    /// A concurrent upload of identical content won the uniqueness
    /// constraint; this completion adopted the winning asset.
    Deduplicated { asset_id: Uuid },
}

/// Registry of per-session exclusive locks.
///
/// Every mutating operation on one session (chunk write, completion, abort)
/// runs under that session's lock, so staging-file access and the progress
/// read-modify-write never interleave. Different sessions proceed fully in
/// parallel. Entries are evicted once a session reaches a terminal state;
/// a task still holding an evicted handle finds the session no longer
/// `active` when it re-fetches the row.
#[derive(Clone, Default)]
struct SessionLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    async fn handle(&self, session_id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(session_id).or_default().clone()
    }

    async fn evict(&self, session_id: Uuid) {
        self.inner.lock().await.remove(&session_id);
    }
}

/// UploadService owns the session lifecycle end to end:
/// - `initiate_upload` — dedup check, session + staging allocation
/// - `write_chunk` — random-offset staging write, monotonic progress
/// - `complete_upload` — verify, promote, create asset, retire session
/// - `abort_session` / `list_stale_sessions` — the reaper interface
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool used for session and asset metadata.
    pub db: Arc<SqlitePool>,

    staging: StagingArea,
    store: Arc<dyn ObjectStore>,
    locks: SessionLocks,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, staging: StagingArea, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            db,
            staging,
            store,
            locks: SessionLocks::default(),
        }
    }

    /// Directory holding per-session staging files (readiness checks).
    pub fn staging_dir(&self) -> &Path {
        self.staging.dir()
    }

    /// Start a new upload, or short-circuit when the owner already has an
    /// asset with the declared content hash.
    pub async fn initiate_upload(
        &self,
        owner_id: Uuid,
        upload: NewUpload,
    ) -> UploadResult<InitiateOutcome> {
        if upload.filename.trim().is_empty() {
            return Err(UploadError::InvalidRequest("filename must not be empty".into()));
        }
        if upload.size < 0 {
            return Err(UploadError::InvalidRequest("size must not be negative".into()));
        }

        let content_hash = upload.content_hash.filter(|h| !h.is_empty());

        if let Some(hash) = content_hash.as_deref() {
            if let Some(asset_id) = self.asset_id_by_hash(owner_id, hash).await? {
                debug!(owner = %owner_id, %asset_id, "dedup hit, content already stored");
                return Ok(InitiateOutcome::Exists { asset_id });
            }
        }

        let session_id = Uuid::new_v4();
        let staging_path = self.staging.allocate(session_id).await?;
        let now = Utc::now();

        let inserted = sqlx::query(
            "INSERT INTO uploads (id, owner_id, filename, mime, taken_at, content_hash,
                                  total_size, uploaded_offset, staging_path, status,
                                  created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(owner_id)
        .bind(&upload.filename)
        .bind(&upload.mime)
        .bind(upload.taken_at)
        .bind(&content_hash)
        .bind(upload.size)
        .bind(staging_path.display().to_string())
        .bind(SessionStatus::Active)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await;

        if let Err(err) = inserted {
            // do not leave a dangling staging file behind a failed insert
            let _ = self.staging.remove(&staging_path).await;
            return Err(err.into());
        }

        info!(session = %session_id, owner = %owner_id, size = upload.size, "upload session created");
        Ok(InitiateOutcome::Started { session_id })
    }

    /// Stage one chunk at `offset` and return the post-write progress
    /// marker. The marker is `max(previous, offset + len)`, so retried and
    /// out-of-order writes never move it backwards.
    pub async fn write_chunk(
        &self,
        session_id: Uuid,
        offset: i64,
        bytes: &[u8],
    ) -> UploadResult<i64> {
        let lock = self.locks.handle(session_id).await;
        let _guard = lock.lock().await;

        let session = self.fetch_session(session_id).await?;
        ensure_active(&session)?;

        let end = offset
            .checked_add(bytes.len() as i64)
            .filter(|end| offset >= 0 && *end <= session.total_size)
            .ok_or(UploadError::InvalidRange {
                offset,
                len: bytes.len(),
                total_size: session.total_size,
            })?;

        self.staging
            .write_at(Path::new(&session.staging_path), offset as u64, bytes)
            .await?;

        let new_offset = session.uploaded_offset.max(end);
        sqlx::query("UPDATE uploads SET uploaded_offset = ?, updated_at = ? WHERE id = ?")
            .bind(new_offset)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&*self.db)
            .await?;

        debug!(session = %session_id, offset, len = bytes.len(), progress = new_offset, "chunk staged");
        Ok(new_offset)
    }

    /// Seal a fully staged upload: verify size (and hash, when the declared
    /// hash is md5-shaped), promote the staged bytes to durable storage,
    /// create the asset record, mark the session completed, and release the
    /// staging file.
    ///
    /// Every failure before the asset record exists leaves the session
    /// `active` so the client can resume or retry. A retry may promote a
    /// second object under a fresh key; the earlier one is a tolerated
    /// orphan — durable objects are never rolled back.
    pub async fn complete_upload(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> UploadResult<CompleteOutcome> {
        let lock = self.locks.handle(session_id).await;
        let _guard = lock.lock().await;

        let session = self.fetch_session(session_id).await?;
        if session.owner_id != owner_id {
            return Err(UploadError::SessionNotFound(session_id));
        }
        ensure_active(&session)?;

        let staging_path = Path::new(&session.staging_path);
        let staged = self.staging.len(staging_path).await? as i64;
        if staged != session.total_size {
            return Err(UploadError::UploadIncomplete {
                staged,
                expected: session.total_size,
            });
        }

        if let Some(declared) = session.content_hash.as_deref().filter(|h| is_md5_hex(h)) {
            let computed = md5_of_file(staging_path).await?;
            if !declared.eq_ignore_ascii_case(&computed) {
                return Err(UploadError::ChecksumMismatch {
                    declared: declared.to_string(),
                    computed,
                });
            }
        }

        // content-independent key: collision-free even when two sessions
        // complete the same content concurrently
        let storage_key = format!("{}/{}/original", session.owner_id, Uuid::new_v4());
        let file = self.staging.open(staging_path).await?;
        self.store
            .put(&storage_key, Box::pin(ReaderStream::new(file)), session.total_size)
            .await?;

        let outcome = self.create_asset(&session, &storage_key).await?;
        let asset_id = match &outcome {
            CompleteOutcome::Completed { asset_id } => *asset_id,
            CompleteOutcome::Deduplicated { asset_id } => *asset_id,
        };

        // the asset exists from here on; a session is never marked
        // completed without one
        sqlx::query("UPDATE uploads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(SessionStatus::Completed)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&*self.db)
            .await?;

        if let Err(err) = self.staging.remove(staging_path).await {
            warn!(session = %session_id, error = %err, "failed to remove staging file");
        }
        self.locks.evict(session_id).await;

        info!(session = %session_id, %asset_id, key = %storage_key, "upload completed");
        Ok(outcome)
    }

    /// Abort a session and release its staging file. Idempotent: aborting a
    /// session that already reached a terminal state is a no-op.
    pub async fn abort_session(&self, session_id: Uuid) -> UploadResult<()> {
        let lock = self.locks.handle(session_id).await;
        let _guard = lock.lock().await;

        let session = self.fetch_session(session_id).await?;
        if session.status != SessionStatus::Active {
            return Ok(());
        }

        sqlx::query("UPDATE uploads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(SessionStatus::Aborted)
            .bind(Utc::now())
            .bind(session_id)
            .execute(&*self.db)
            .await?;

        if let Err(err) = self.staging.remove(Path::new(&session.staging_path)).await {
            warn!(session = %session_id, error = %err, "failed to remove staging file");
        }
        self.locks.evict(session_id).await;

        info!(session = %session_id, "upload session aborted");
        Ok(())
    }

    /// Active sessions with no activity since `older_than`, oldest first.
    /// The reaper feeds these back into `abort_session`.
    pub async fn list_stale_sessions(
        &self,
        older_than: DateTime<Utc>,
    ) -> UploadResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, mime, taken_at, content_hash, total_size,
                    uploaded_offset, staging_path, status, created_at, updated_at
             FROM uploads
             WHERE status = ? AND updated_at < ?
             ORDER BY updated_at ASC",
        )
        .bind(SessionStatus::Active)
        .bind(older_than)
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }

    async fn fetch_session(&self, session_id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, owner_id, filename, mime, taken_at, content_hash, total_size,
                    uploaded_offset, staging_path, status, created_at, updated_at
             FROM uploads WHERE id = ?",
        )
        .bind(session_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::SessionNotFound(session_id),
            other => UploadError::Sqlx(other),
        })
    }

    async fn asset_id_by_hash(&self, owner_id: Uuid, hash: &str) -> UploadResult<Option<Uuid>> {
        let asset_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM assets WHERE owner_id = ? AND content_hash = ?",
        )
        .bind(owner_id)
        .bind(hash)
        .fetch_optional(&*self.db)
        .await?;
        Ok(asset_id)
    }

    /// Create the asset record for a promoted upload, with a bounded retry
    /// against transient store failure. A `(owner_id, content_hash)`
    /// uniqueness violation means a concurrent completion of identical
    /// content won the race; the winning asset is re-queried and adopted.
    async fn create_asset(
        &self,
        session: &UploadSession,
        storage_key: &str,
    ) -> UploadResult<CompleteOutcome> {
        let mut last_err: Option<sqlx::Error> = None;

        for attempt in 1..=ASSET_CREATE_ATTEMPTS {
            match self.insert_asset(session, storage_key).await {
                Ok(asset_id) => return Ok(CompleteOutcome::Completed { asset_id }),
                Err(err) if is_unique_violation(&err) => {
                    let hash = session.content_hash.as_deref().unwrap_or_default();
                    if let Some(asset_id) = self.asset_id_by_hash(session.owner_id, hash).await? {
                        debug!(session = %session.id, %asset_id, "lost dedup race, adopting winning asset");
                        return Ok(CompleteOutcome::Deduplicated { asset_id });
                    }
                    // winner vanished between the violation and the
                    // re-query; insert again
                    last_err = Some(err);
                }
                Err(err) => {
                    warn!(session = %session.id, attempt, error = %err, "asset creation failed");
                    last_err = Some(err);
                }
            }
        }

        Err(UploadError::Sqlx(last_err.unwrap_or(sqlx::Error::RowNotFound)))
    }

    async fn insert_asset(
        &self,
        session: &UploadSession,
        storage_key: &str,
    ) -> Result<Uuid, sqlx::Error> {
        let asset_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO assets (id, owner_id, filename, size, mime, content_hash,
                                 taken_at, storage_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(asset_id)
        .bind(session.owner_id)
        .bind(&session.filename)
        .bind(session.total_size)
        .bind(&session.mime)
        .bind(&session.content_hash)
        .bind(session.taken_at)
        .bind(storage_key)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(asset_id)
    }
}

fn ensure_active(session: &UploadSession) -> UploadResult<()> {
    if session.status != SessionStatus::Active {
        return Err(UploadError::SessionNotActive {
            id: session.id,
            status: session.status,
        });
    }
    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn is_md5_hex(hash: &str) -> bool {
    hash.len() == 32 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn md5_of_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    let mut digest = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.consume(&buf[..n]);
    }
    Ok(format!("{:x}", digest.compute()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::Asset;
    use crate::services::object_store::DiskObjectStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use tokio::fs;

    // md5("helloworld")
    const HELLOWORLD_MD5: &str = "fc5e038d38a57032085441e7fe7010b0";

    async fn service() -> (UploadService, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("sqlite pool");
        for stmt in include_str!("../../migrations/0001_init.sql")
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            sqlx::query(stmt).execute(&pool).await.expect("migration");
        }

        let staging = StagingArea::new(dir.path().join("staging"));
        staging.ensure_dir().await.unwrap();
        let store = DiskObjectStore::new(dir.path().join("objects"));
        let service = UploadService::new(Arc::new(pool), staging, Arc::new(store));
        (service, dir)
    }

    fn upload(filename: &str, size: i64, hash: Option<&str>) -> NewUpload {
        NewUpload {
            filename: filename.to_string(),
            size,
            mime: Some("image/jpeg".to_string()),
            taken_at: None,
            content_hash: hash.map(str::to_string),
        }
    }

    async fn start(service: &UploadService, owner: Uuid, new: NewUpload) -> Uuid {
        match service.initiate_upload(owner, new).await.unwrap() {
            InitiateOutcome::Started { session_id } => session_id,
            other => panic!("expected a fresh session, got {:?}", other),
        }
    }

    async fn session_count(service: &UploadService) -> i64 {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM uploads")
            .fetch_one(&*service.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initiate_rejects_malformed_input() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();

        let err = service
            .initiate_upload(owner, upload("", 10, None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));

        let err = service
            .initiate_upload(owner, upload("a.jpg", -1, None))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidRequest(_)));

        assert_eq!(session_count(&service).await, 0);
    }

    #[tokio::test]
    async fn chunk_offset_is_monotonic_and_idempotent() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 10, None)).await;

        assert_eq!(service.write_chunk(id, 0, b"hello").await.unwrap(), 5);
        assert_eq!(service.write_chunk(id, 5, b"world").await.unwrap(), 10);
        // retrying an earlier chunk never moves progress backwards
        assert_eq!(service.write_chunk(id, 0, b"hello").await.unwrap(), 10);

        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.uploaded_offset, 10);
        let staged = fs::read(&session.staging_path).await.unwrap();
        assert_eq!(staged, b"helloworld");
    }

    #[tokio::test]
    async fn repeated_identical_chunk_yields_same_bytes_and_offset() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 15, None)).await;

        let first = service.write_chunk(id, 10, b"abcde").await.unwrap();
        let second = service.write_chunk(id, 10, b"abcde").await.unwrap();
        assert_eq!(first, 15);
        assert_eq!(second, 15);

        let session = service.fetch_session(id).await.unwrap();
        let staged = fs::read(&session.staging_path).await.unwrap();
        assert_eq!(&staged[10..15], b"abcde");
    }

    #[tokio::test]
    async fn out_of_bounds_chunk_is_rejected_without_side_effects() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 10, None)).await;
        service.write_chunk(id, 0, b"hello").await.unwrap();

        let err = service.write_chunk(id, 8, b"toolong").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRange { .. }));
        let err = service.write_chunk(id, -1, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidRange { .. }));

        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.uploaded_offset, 5);
        assert_eq!(fs::read(&session.staging_path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn incomplete_upload_cannot_complete_and_stays_resumable() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 10, None)).await;
        service.write_chunk(id, 0, b"hello").await.unwrap();

        let err = service.complete_upload(owner, id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::UploadIncomplete { staged: 5, expected: 10 }
        ));

        // still active: the client may keep sending chunks and retry
        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(service.write_chunk(id, 5, b"world").await.unwrap(), 10);
        assert!(matches!(
            service.complete_upload(owner, id).await.unwrap(),
            CompleteOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn end_to_end_upload_then_dedup() {
        let (service, dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(
            &service,
            owner,
            upload("pic.jpg", 10, Some(HELLOWORLD_MD5)),
        )
        .await;

        assert_eq!(service.write_chunk(id, 0, b"hello").await.unwrap(), 5);
        assert_eq!(service.write_chunk(id, 5, b"world").await.unwrap(), 10);

        let asset_id = match service.complete_upload(owner, id).await.unwrap() {
            CompleteOutcome::Completed { asset_id } => asset_id,
            other => panic!("expected a fresh asset, got {:?}", other),
        };

        let asset = sqlx::query_as::<_, Asset>(
            "SELECT id, owner_id, filename, size, mime, content_hash, taken_at,
                    storage_key, created_at
             FROM assets WHERE id = ?",
        )
        .bind(asset_id)
        .fetch_one(&*service.db)
        .await
        .unwrap();
        assert_eq!(asset.size, 10);
        assert_eq!(asset.owner_id, owner);
        assert_eq!(asset.content_hash.as_deref(), Some(HELLOWORLD_MD5));

        // promoted object landed under the content-independent key
        let object = fs::read(dir.path().join("objects").join(&asset.storage_key))
            .await
            .unwrap();
        assert_eq!(object, b"helloworld");

        // session retired, staging file released
        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(fs::metadata(&session.staging_path).await.is_err());

        // a repeat upload of the same content short-circuits, twice
        for _ in 0..2 {
            match service
                .initiate_upload(owner, upload("pic.jpg", 10, Some(HELLOWORLD_MD5)))
                .await
                .unwrap()
            {
                InitiateOutcome::Exists { asset_id: existing } => assert_eq!(existing, asset_id),
                other => panic!("expected dedup hit, got {:?}", other),
            }
        }
        assert_eq!(session_count(&service).await, 1);
    }

    #[tokio::test]
    async fn out_of_order_chunks_complete_identically() {
        let (service, dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("pic.jpg", 10, None)).await;

        assert_eq!(service.write_chunk(id, 5, b"world").await.unwrap(), 10);
        assert_eq!(service.write_chunk(id, 0, b"hello").await.unwrap(), 10);

        service.complete_upload(owner, id).await.unwrap();

        let key = sqlx::query_scalar::<_, String>("SELECT storage_key FROM assets")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        let object = fs::read(dir.path().join("objects").join(&key)).await.unwrap();
        assert_eq!(object, b"helloworld");
    }

    #[tokio::test]
    async fn terminal_sessions_reject_chunks_and_completion() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 5, None)).await;
        service.write_chunk(id, 0, b"hello").await.unwrap();
        service.complete_upload(owner, id).await.unwrap();

        let err = service.write_chunk(id, 0, b"hello").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotActive { .. }));
        let err = service.complete_upload(owner, id).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotActive { .. }));

        // abort after completion is an idempotent no-op
        service.abort_session(id).await.unwrap();
        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn abort_releases_staging_and_is_terminal() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 10, None)).await;
        service.write_chunk(id, 0, b"hello").await.unwrap();

        service.abort_session(id).await.unwrap();

        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
        assert!(fs::metadata(&session.staging_path).await.is_err());

        let err = service.write_chunk(id, 5, b"world").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotActive { .. }));
    }

    #[tokio::test]
    async fn declared_hash_mismatch_blocks_completion() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let wrong_hash = "00000000000000000000000000000000";
        let id = start(&service, owner, upload("a.jpg", 10, Some(wrong_hash))).await;
        service.write_chunk(id, 0, b"helloworld").await.unwrap();

        let err = service.complete_upload(owner, id).await.unwrap_err();
        assert!(matches!(err, UploadError::ChecksumMismatch { .. }));
        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (service, _dir) = service().await;
        let missing = Uuid::new_v4();

        let err = service.write_chunk(missing, 0, b"x").await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(id) if id == missing));
        let err = service
            .complete_upload(Uuid::new_v4(), missing)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn completion_requires_the_owning_principal() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 5, None)).await;
        service.write_chunk(id, 0, b"hello").await.unwrap();

        let err = service
            .complete_upload(Uuid::new_v4(), id)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));

        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn stale_listing_returns_only_idle_active_sessions() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let idle = start(&service, owner, upload("old.jpg", 10, None)).await;
        let fresh = start(&service, owner, upload("new.jpg", 10, None)).await;

        let long_ago = Utc::now() - chrono::Duration::hours(2);
        sqlx::query("UPDATE uploads SET updated_at = ? WHERE id = ?")
            .bind(long_ago)
            .bind(idle)
            .execute(&*service.db)
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let stale = service.list_stale_sessions(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, idle);

        service.abort_session(idle).await.unwrap();
        assert!(service.list_stale_sessions(cutoff).await.unwrap().is_empty());

        // the fresh session is untouched
        let session = service.fetch_session(fresh).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn concurrent_writers_to_one_session_stay_consistent() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();
        let id = start(&service, owner, upload("a.jpg", 10, None)).await;

        let (a, b) = tokio::join!(
            service.write_chunk(id, 0, b"hello"),
            service.write_chunk(id, 5, b"world"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        // whichever write lands second reports the full extent
        assert_eq!(a.max(b), 10);
        let session = service.fetch_session(id).await.unwrap();
        assert_eq!(session.uploaded_offset, 10);
        assert_eq!(fs::read(&session.staging_path).await.unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn concurrent_completions_of_identical_content_converge_on_one_asset() {
        let (service, _dir) = service().await;
        let owner = Uuid::new_v4();

        // two sessions racing the same content past the initiate-time
        // dedup check
        let first = start(&service, owner, upload("a.jpg", 10, Some(HELLOWORLD_MD5))).await;
        let second = start(&service, owner, upload("a.jpg", 10, Some(HELLOWORLD_MD5))).await;
        service.write_chunk(first, 0, b"helloworld").await.unwrap();
        service.write_chunk(second, 0, b"helloworld").await.unwrap();

        let winner = match service.complete_upload(owner, first).await.unwrap() {
            CompleteOutcome::Completed { asset_id } => asset_id,
            other => panic!("expected a fresh asset, got {:?}", other),
        };
        let loser = match service.complete_upload(owner, second).await.unwrap() {
            CompleteOutcome::Deduplicated { asset_id } => asset_id,
            other => panic!("expected the dedup path, got {:?}", other),
        };
        assert_eq!(winner, loser);

        let assets = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM assets")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(assets, 1);

        // both sessions retired
        for id in [first, second] {
            let session = service.fetch_session(id).await.unwrap();
            assert_eq!(session.status, SessionStatus::Completed);
        }
    }
}
