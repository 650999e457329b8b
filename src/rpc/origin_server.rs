//! Reference implementation of the origin server collaborator (§4.6).
//!
//! The origin is otherwise only an RPC peer; this module supplies a
//! concrete, well-behaved one backed by a directory on disk, used by the
//! bundled standalone binary and by the test suite. It maintains
//! `path -> current_version` and the version-bump rules: a write at
//! `offset == 0` bumps the version once per write-back session; `unlink`
//! bumps the version and deletes.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::{FetchResponse, Origin, OriginError, Result};
use crate::session::OpenMode;

/// In-process origin server rooted at a directory on disk.
///
/// Every path's operations are serialized through a single mutex guarding
/// the version table, a single-threaded-equivalent stand-in for "each
/// path's operations are serialized" that is adequate for a reference peer.
pub struct OriginServer {
    root: PathBuf,
    versions: Mutex<HashMap<PathBuf, i64>>,
}

impl OriginServer {
    /// Root the origin's authoritative store at `root`, creating it if needed.
    pub fn new(root: PathBuf) -> Self {
        Self { root, versions: Mutex::new(HashMap::new()) }
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Origin for OriginServer {
    async fn fetch(
        &self,
        path: &Path,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<FetchResponse> {
        let mut versions = self.versions.lock().await;
        let abs = self.full_path(path);

        let metadata = tokio::fs::symlink_metadata(&abs).await;
        let exists = metadata.is_ok();

        if exists && metadata.as_ref().unwrap().is_dir() {
            return Ok(FetchResponse::Invalid { error: OriginError::IsDir });
        }

        if mode == OpenMode::CreateNew {
            if exists {
                return Ok(FetchResponse::Invalid { error: OriginError::Exist });
            }
            if let Some(parent) = abs.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            tokio::fs::File::create(&abs)
                .await
                .map_err(|e| super::TransportError(e.to_string()))?;
            let version = versions.get(path).copied().unwrap_or(0) + 1;
            versions.insert(path.to_path_buf(), version);
            debug!(?path, version, "origin created new file");
            return Ok(FetchResponse::Chunk { version, file_size: 0, bytes: Vec::new() });
        }

        if !exists {
            if mode == OpenMode::Create {
                if let Some(parent) = abs.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                tokio::fs::File::create(&abs)
                    .await
                    .map_err(|e| super::TransportError(e.to_string()))?;
                let version = versions.get(path).copied().unwrap_or(0) + 1;
                versions.insert(path.to_path_buf(), version);
                return Ok(FetchResponse::Chunk { version, file_size: 0, bytes: Vec::new() });
            }
            return Ok(FetchResponse::Invalid { error: OriginError::NoEnt });
        }

        let file_size = metadata.unwrap().len();
        let current_version = versions.get(path).copied().unwrap_or(1);
        versions.entry(path.to_path_buf()).or_insert(current_version);

        if known_version == current_version {
            return Ok(FetchResponse::UpToDate { version: current_version });
        }

        let bytes = if offset >= file_size {
            Vec::new()
        } else {
            use tokio::io::AsyncReadExt as _;
            let mut file =
                tokio::fs::File::open(&abs).await.map_err(|e| super::TransportError(e.to_string()))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| super::TransportError(e.to_string()))?;
            let remaining = (file_size - offset).min(super::CHUNK_SIZE as u64) as usize;
            let mut buf = vec![0u8; remaining];
            file.read_exact(&mut buf).await.map_err(|e| super::TransportError(e.to_string()))?;
            buf
        };

        Ok(FetchResponse::Chunk { version: current_version, file_size, bytes })
    }

    async fn write(
        &self,
        path: &Path,
        bytes: &[u8],
        offset: u64,
    ) -> Result<std::result::Result<i64, OriginError>> {
        let mut versions = self.versions.lock().await;
        let abs = self.full_path(path);

        if let Some(parent) = abs.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let version = if offset == 0 {
            let new_version = versions.get(path).copied().unwrap_or(0) + 1;
            versions.insert(path.to_path_buf(), new_version);
            new_version
        } else {
            versions.get(path).copied().unwrap_or(1)
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&abs)
            .await
            .map_err(|e| super::TransportError(e.to_string()))?;
        file.seek(SeekFrom::Start(offset)).await.map_err(|e| super::TransportError(e.to_string()))?;
        file.write_all(bytes).await.map_err(|e| super::TransportError(e.to_string()))?;
        file.flush().await.map_err(|e| super::TransportError(e.to_string()))?;

        debug!(?path, offset, len = bytes.len(), version, "origin write");
        Ok(Ok(version))
    }

    async fn unlink(&self, path: &Path) -> Result<std::result::Result<(), OriginError>> {
        let mut versions = self.versions.lock().await;
        let abs = self.full_path(path);

        match tokio::fs::remove_file(&abs).await {
            Ok(()) => {
                let new_version = versions.get(path).copied().unwrap_or(0) + 1;
                versions.insert(path.to_path_buf(), new_version);
                debug!(?path, new_version, "origin unlink");
                Ok(Ok(()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(Err(OriginError::NoEnt))
            }
            Err(err) => Err(super::TransportError(err.to_string())),
        }
    }
}
