// crates/challengectl-blobstore/src/lib.rs
// ============================================================================
// Crate: challengectl-blobstore
// Description: Local-disk, content-addressed binary storage.
// Purpose: Give runners a durable place to fetch the files a challenge's
//          config references, keyed and verified by SHA-256 digest.
// Dependencies: challengectl-core, tempfile, tokio, tokio-stream
// ============================================================================

//! ## Overview
//! Blobs live at `<base_dir>/files/<first-two-hex>/<digest>`. `put` hashes
//! the whole buffer, writes to a temp file in the same directory, then
//! renames into place — a no-op if the target already exists, matching
//! writing the same content twice is a no-op after the first write.
//! `get` re-hashes what it reads before handing any bytes back, so a
//! corrupted on-disk blob is never silently served.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use challengectl_core::sha256_hex;
use challengectl_core::BlobStore;
use challengectl_core::BlobStoreError;
use challengectl_core::ByteStream;
use challengectl_core::FileDigest;
use challengectl_core::FileRecord;
use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Chunk size used when handing content back as a stream.
const STREAM_CHUNK_BYTES: usize = 64 * 1024;

// ============================================================================
// SECTION: Metadata sidecar
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaRecord {
    filename: String,
    size: u64,
    mime_type: String,
}

// ============================================================================
// SECTION: LocalBlobStore
// ============================================================================

/// A [`BlobStore`] backed by a plain directory tree on local disk.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_dir: PathBuf,
}

impl LocalBlobStore {
    /// Opens (creating if necessary) a blob store rooted at `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobStoreError::Io`] if the directory tree cannot be created.
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(base_dir.join("files")).await.map_err(|err| BlobStoreError::Io(err.to_string()))?;
        tokio::fs::create_dir_all(base_dir.join("meta")).await.map_err(|err| BlobStoreError::Io(err.to_string()))?;
        Ok(Self { base_dir })
    }

    fn blob_path(&self, digest: &FileDigest) -> PathBuf {
        let hex = digest.as_str();
        let shard = hex.get(0..2).unwrap_or("00");
        self.base_dir.join("files").join(shard).join(hex)
    }

    fn meta_path(&self, digest: &FileDigest) -> PathBuf {
        self.base_dir.join("meta").join(format!("{}.json", digest.as_str()))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<FileDigest, BlobStoreError> {
        let digest = sha256_hex(bytes);
        let target = self.blob_path(&digest);
        if tokio::fs::try_exists(&target).await.map_err(|err| BlobStoreError::Io(err.to_string()))? {
            return Ok(digest);
        }
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| BlobStoreError::Io("blob path has no parent".to_owned()))?;
        tokio::fs::create_dir_all(&parent).await.map_err(|err| BlobStoreError::Io(err.to_string()))?;
        let owned = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&parent, &target, &owned))
            .await
            .map_err(|err| BlobStoreError::Io(err.to_string()))??;
        Ok(digest)
    }

    async fn get(&self, digest: &FileDigest) -> Result<ByteStream, BlobStoreError> {
        let path = self.blob_path(digest);
        if !tokio::fs::try_exists(&path).await.map_err(|err| BlobStoreError::Io(err.to_string()))? {
            return Err(BlobStoreError::NotFound);
        }
        let content = tokio::fs::read(&path).await.map_err(|err| BlobStoreError::Io(err.to_string()))?;
        let actual = sha256_hex(&content);
        if &actual != digest {
            return Err(BlobStoreError::DigestMismatch(digest.clone()));
        }
        let chunks: Vec<Result<Bytes, BlobStoreError>> = content.chunks(STREAM_CHUNK_BYTES).map(|chunk| Ok(Bytes::copy_from_slice(chunk))).collect();
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn register(&self, filename: &str, digest: &FileDigest, size: u64, mime_type: &str) -> Result<(), BlobStoreError> {
        let blob_path = self.blob_path(digest);
        if !tokio::fs::try_exists(&blob_path).await.map_err(|err| BlobStoreError::Io(err.to_string()))? {
            return Err(BlobStoreError::NotFound);
        }
        let record = MetaRecord { filename: filename.to_owned(), size, mime_type: mime_type.to_owned() };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|err| BlobStoreError::Io(err.to_string()))?;
        let target = self.meta_path(digest);
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| BlobStoreError::Io("meta path has no parent".to_owned()))?;
        tokio::task::spawn_blocking(move || write_atomic(&parent, &target, &bytes))
            .await
            .map_err(|err| BlobStoreError::Io(err.to_string()))??;
        Ok(())
    }

    async fn stat(&self, digest: &FileDigest) -> Result<Option<FileRecord>, BlobStoreError> {
        let path = self.meta_path(digest);
        if !tokio::fs::try_exists(&path).await.map_err(|err| BlobStoreError::Io(err.to_string()))? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await.map_err(|err| BlobStoreError::Io(err.to_string()))?;
        let record: MetaRecord = serde_json::from_slice(&bytes).map_err(|err| BlobStoreError::Io(err.to_string()))?;
        Ok(Some(FileRecord { digest: digest.clone(), filename: record.filename, size: record.size, mime_type: record.mime_type }))
    }
}

/// Writes `bytes` to a temp file inside `dir`, then atomically renames it
/// onto `target`. Blocking; must run on a `spawn_blocking` thread.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), BlobStoreError> {
    use std::io::Write;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| BlobStoreError::Io(err.to_string()))?;
    temp.write_all(bytes).map_err(|err| BlobStoreError::Io(err.to_string()))?;
    temp.flush().map_err(|err| BlobStoreError::Io(err.to_string()))?;
    temp.persist(target).map_err(|err| BlobStoreError::Io(err.error.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let digest = store.put(b"hello world").await.expect("put");

        let mut stream = store.get(&digest).await.expect("get");
        let mut collected = Vec::new();
        use tokio_stream::StreamExt;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn put_is_idempotent_for_identical_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let first = store.put(b"same content").await.expect("first put");
        let second = store.put(b"same content").await.expect("second put");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn get_detects_tampered_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let digest = store.put(b"original").await.expect("put");
        let path = store.blob_path(&digest);
        tokio::fs::write(&path, b"tampered!").await.expect("tamper");

        let result = store.get(&digest).await;
        assert!(matches!(result, Err(BlobStoreError::DigestMismatch(_))));
    }

    #[tokio::test]
    async fn get_missing_digest_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let digest = sha256_hex(b"never stored");
        assert!(matches!(store.get(&digest).await, Err(BlobStoreError::NotFound)));
    }

    #[tokio::test]
    async fn register_then_stat_round_trips_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let digest = store.put(b"payload bytes").await.expect("put");
        store.register("payload.bin", &digest, 13, "application/octet-stream").await.expect("register");

        let stat = store.stat(&digest).await.expect("stat").expect("present");
        assert_eq!(stat.filename, "payload.bin");
        assert_eq!(stat.size, 13);
        assert_eq!(stat.mime_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn register_unknown_digest_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalBlobStore::open(dir.path()).await.expect("open");
        let digest = sha256_hex(b"never put");
        let result = store.register("x.bin", &digest, 1, "application/octet-stream").await;
        assert!(matches!(result, Err(BlobStoreError::NotFound)));
    }
}
