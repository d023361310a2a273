//! Temp staging area: one byte-addressable scratch file per in-flight
//! upload session.
//!
//! Files are named by session id and live under a single staging directory.
//! A staging file is exclusively owned by its session from allocation until
//! completion or abort releases it.

use std::io::{self, ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Handle to the staging directory holding per-session scratch files.
#[derive(Clone, Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the scratch files live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the staging directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Scratch-file path for a session. Session ids are unique, so the path
    /// is never shared with or reused by another session.
    pub fn path_for(&self, session_id: Uuid) -> PathBuf {
        self.dir.join(format!("upload_{}", session_id))
    }

    /// Create the (empty) scratch file for a new session and return its path.
    pub async fn allocate(&self, session_id: Uuid) -> io::Result<PathBuf> {
        let path = self.path_for(session_id);
        File::create(&path).await?;
        Ok(path)
    }

    /// Write `bytes` at `offset` — a random-access write, not an append.
    ///
    /// The file is flushed and fsynced before returning so recorded progress
    /// never runs ahead of durably staged bytes. Rewriting the same range is
    /// a no-op with respect to final content; overlapping rewrites are
    /// last-writer-wins.
    pub async fn write_at(&self, path: &Path, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create(true).open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Current byte length of a scratch file.
    pub async fn len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }

    /// Open a scratch file for reading (promotion to durable storage).
    pub async fn open(&self, path: &Path) -> io::Result<File> {
        File::open(path).await
    }

    /// Delete a scratch file, tolerating one that is already gone.
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
