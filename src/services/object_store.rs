//! Durable object storage collaborator.
//!
//! The upload core only ever creates objects (`put`); nothing here mutates
//! or deletes them. `DiskObjectStore` is the local-filesystem backend; the
//! trait is the seam a remote backend would implement.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::pin::Pin;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Byte stream fed into `ObjectStore::put`.
pub type PutStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Append-only durable storage for finalized upload payloads.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `stream` under `key`. `size` is the expected total byte count;
    /// a stream that ends short or long of it is an error.
    async fn put(&self, key: &str, stream: PutStream, size: i64) -> io::Result<()>;
}

/// Local-disk object store rooted at a base directory.
///
/// Keys are path-like (`<owner>/<uuid>/original`) and map directly to
/// files beneath `base_path`.
#[derive(Clone, Debug)]
pub struct DiskObjectStore {
    base_path: PathBuf,
}

impl DiskObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject keys that could escape the base directory. Keys are
    /// server-generated, so a failure here indicates a bug upstream.
    fn ensure_key_safe(key: &str) -> io::Result<()> {
        if key.is_empty() || key.starts_with('/') || key.contains("..") {
            return Err(io::Error::new(ErrorKind::InvalidInput, "invalid object key"));
        }
        if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(io::Error::new(ErrorKind::InvalidInput, "invalid object key"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    /// Stream the payload to a temporary file, fsync, then atomically rename
    /// into place. Temp files are removed on every failure path.
    async fn put(&self, key: &str, stream: PutStream, size: i64) -> io::Result<()> {
        Self::ensure_key_safe(key)?;

        let file_path = self.base_path.join(key);
        let parent = file_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "object key has no parent"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut written: i64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            written += chunk.len() as i64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if written != size {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("object stream yielded {} bytes, expected {}", written, size),
            ));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(())
    }
}
