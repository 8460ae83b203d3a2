// crates/challengectl-runner/src/cache.rs
// ============================================================================
// Module: File Cache
// Description: Content-addressed local storage for files a challenge's
//              config references (spec.md §4.8's "sync required files").
// Purpose: Avoid re-downloading a file the runner already has, while never
//          trusting a cache hit it cannot verify.
// Dependencies: challengectl-core, tempfile, tokio
// ============================================================================

//! ## Overview
//! Cached files are named directly by their digest, one file per digest
//! under `cache_dir`, mirroring `challengectl-blobstore`'s content-addressed
//! layout but flat (the runner's cache is expected to hold at most a few
//! thousand entries, not the controller's full corpus). A cache hit is only
//! trusted after byte-for-byte content is confirmed to still hash to the
//! name it is stored under; on mismatch the stale entry is evicted and
//! re-fetched rather than served.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;

use challengectl_core::sha256_hex;
use challengectl_core::FileDigest;
use tokio::fs;

use crate::client::ControllerClient;
use crate::error::RunnerError;

// ============================================================================
// SECTION: FileCache
// ============================================================================

/// Local, content-addressed file cache backing a runner's working directory.
pub struct FileCache {
    cache_dir: PathBuf,
}

impl FileCache {
    /// Opens (creating if necessary) a cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Io`] if the directory cannot be created.
    pub async fn open(cache_dir: impl Into<PathBuf>) -> Result<Self, RunnerError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).await?;
        Ok(Self { cache_dir })
    }

    fn path_for(&self, digest: &FileDigest) -> PathBuf {
        self.cache_dir.join(digest.as_str())
    }

    /// Returns the local path for `digest`, downloading it through `client`
    /// first if it is not already cached (or if the cached copy fails a
    /// re-hash check).
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::DigestMismatch`] if the downloaded content does
    /// not hash to `digest`, or any transport/IO error from the download or
    /// the atomic write.
    pub async fn ensure(&self, client: &ControllerClient, digest: &FileDigest) -> Result<PathBuf, RunnerError> {
        let path = self.path_for(digest);
        if self.verify(&path, digest).await {
            return Ok(path);
        }

        let bytes = client.get_file(digest).await?;
        let actual = sha256_hex(&bytes);
        if &actual != digest {
            return Err(RunnerError::DigestMismatch(actual));
        }
        self.write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    async fn verify(&self, path: &Path, digest: &FileDigest) -> bool {
        let Ok(bytes) = fs::read(path).await else {
            return false;
        };
        &sha256_hex(&bytes) == digest
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), RunnerError> {
        let cache_dir = self.cache_dir.clone();
        let path = path.to_path_buf();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), RunnerError> {
            let mut temp = tempfile::NamedTempFile::new_in(&cache_dir)?;
            std::io::Write::write_all(&mut temp, &bytes)?;
            temp.flush()?;
            temp.persist(&path).map_err(|err| RunnerError::Io(err.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|err| RunnerError::Io(err.to_string()))??;
        Ok(())
    }
}

/// Resolves a challenge's configured [`challengectl_core::FileReference`]
/// list to concrete local paths, downloading content-addressed entries
/// through `cache` and resolving local entries relative to `working_dir`.
///
/// # Errors
///
/// Propagates any [`FileCache::ensure`] failure.
pub async fn resolve_files(cache: &FileCache, client: &ControllerClient, working_dir: &Path, files: &[challengectl_core::FileReference]) -> Result<Vec<PathBuf>, RunnerError> {
    let mut resolved = Vec::with_capacity(files.len());
    for file in files {
        match file {
            challengectl_core::FileReference::ContentAddressed { digest } => {
                resolved.push(cache.ensure(client, digest).await?);
            }
            challengectl_core::FileReference::Local { path } => {
                resolved.push(working_dir.join(path));
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]
    use std::sync::Arc;

    use super::*;
    use crate::log::NoopRunnerLog;

    #[tokio::test]
    async fn write_atomic_then_verify_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::open(dir.path()).await.expect("open cache");
        let digest = sha256_hex(b"hello world");
        let path = cache.path_for(&digest);
        cache.write_atomic(&path, b"hello world").await.expect("write");
        assert!(cache.verify(&path, &digest).await);
    }

    #[tokio::test]
    async fn verify_rejects_tampered_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::open(dir.path()).await.expect("open cache");
        let digest = sha256_hex(b"hello world");
        let path = cache.path_for(&digest);
        cache.write_atomic(&path, b"tampered bytes").await.expect("write");
        assert!(!cache.verify(&path, &digest).await);
    }

    #[tokio::test]
    async fn ensure_skips_download_on_cache_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = FileCache::open(dir.path()).await.expect("open cache");
        let digest = sha256_hex(b"cached content");
        let path = cache.path_for(&digest);
        cache.write_atomic(&path, b"cached content").await.expect("write");

        let client = ControllerClient::new("http://127.0.0.1:0", "aa", "m", Arc::new(NoopRunnerLog)).expect("client");
        let resolved = cache.ensure(&client, &digest).await.expect("cache hit, no network call needed");
        assert_eq!(resolved, path);
    }
}
