//! Defines [`Session`]: the per-client file-handle table and the
//! open/read/write/close/lseek/unlink state machine (§4.4).
//!
//! Every Session operation is driven from the single task that owns the
//! client connection (see [`crate::dispatcher`]), which trivially serializes
//! them: a client never observes its own operations interleaved.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::fs::OpenOptions;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry, EntryId, UNKNOWN_VERSION};
use crate::error::Errno;
use crate::rpc::{FetchResponse, Origin, OriginError, CHUNK_SIZE};

/// Client-requested open mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    /// Open-or-create.
    Create,
    /// Exclusive create; fails if the path already exists on the origin.
    CreateNew,
}

/// `lseek` origin.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Opaque per-session file handle, returned by `open`.
pub type Handle = u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AccessMode {
    Read,
    Write,
}

struct HandleState {
    entry: EntryId,
    path: PathBuf,
    access_mode: AccessMode,
    file: tokio::fs::File,
    position: u64,
    /// Set once this handle has copy-on-written into a private entry.
    writer_private: bool,
}

/// Maps an [`OriginError`] to the fixed client-facing [`Errno`] surface.
fn map_origin_error(error: OriginError) -> Errno {
    match error {
        OriginError::Perm => Errno::Perm,
        OriginError::NoEnt => Errno::NoEnt,
        OriginError::Exist => Errno::Exist,
        OriginError::IsDir => Errno::IsDir,
    }
}

/// Normalize a client-supplied path: resolve `.`/`..` without touching disk,
/// and reject paths that escape the root (a leading `..` that cannot be
/// absorbed by a preceding real component).
fn normalize_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                out.pop();
            }
            std::path::Component::Normal(part) => {
                depth += 1;
                out.push(part);
            }
            std::path::Component::RootDir | std::path::Component::Prefix(_) => {}
        }
    }
    Some(out)
}

/// The on-disk filename for a committed copy of `path` at `version`.
fn base_filename(path: &Path, version: i64) -> String {
    format!("{}_v{version}", path.display())
}

async fn open_read_only(disk_path: &Path) -> Result<tokio::fs::File, Errno> {
    OpenOptions::new().read(true).open(disk_path).await.map_err(|_| Errno::Perm)
}

/// Copy `src` to `dst` in [`CHUNK_SIZE`] pieces, the way a writer-private
/// copy is carved out of a shared readable entry.
async fn chunked_copy(src: &Path, dst: &Path) -> Result<(), Errno> {
    let mut src_file = tokio::fs::File::open(src).await.map_err(|_| Errno::Perm)?;
    let mut dst_file = tokio::fs::File::create(dst).await.map_err(|_| Errno::Perm)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = src_file.read(&mut buf).await.map_err(|_| Errno::Perm)?;
        if n == 0 {
            break;
        }
        dst_file.write_all(&buf[..n]).await.map_err(|_| Errno::Perm)?;
    }
    dst_file.flush().await.map_err(|_| Errno::Perm)?;
    Ok(())
}

/// Per-client file-handle table and state machine (C4).
pub struct Session {
    cache: Arc<Cache>,
    origin: Arc<dyn Origin>,
    next_handle: Handle,
    handles: HashMap<Handle, HandleState>,
}

impl Session {
    /// Construct a Session sharing the process-wide cache and origin client.
    pub fn new(cache: Arc<Cache>, origin: Arc<dyn Origin>) -> Self {
        Self { cache, origin, next_handle: 1, handles: HashMap::new() }
    }

    /// Open `path` under `mode`, holding the cache-wide lock for the whole
    /// operation so concurrent opens of the same path see a consistent
    /// version decision (§4.4).
    pub async fn open(&mut self, path: &Path, mode: OpenMode) -> Result<Handle, Errno> {
        let rel = normalize_path(path).ok_or(Errno::Perm)?;

        let mut guard = self.cache.lock().await;

        if let Some(parent) = rel.parent() {
            if !parent.as_os_str().is_empty() {
                let full_parent = guard.dir().join(parent);
                tokio::fs::create_dir_all(&full_parent).await.map_err(|_| Errno::Perm)?;
            }
        }

        let local = guard.lookup_readable(&rel);
        let known_version = local.map(|id| guard.entry(id).version).unwrap_or(UNKNOWN_VERSION);
        debug!(path = ?rel, cache_hit = local.is_some(), known_version, "cache lookup on open");

        let response = self
            .origin
            .fetch(&rel, mode, known_version, 0)
            .await
            .map_err(|err| {
                warn!(%err, path = ?rel, "fetch RPC failed during open");
                Errno::Perm
            })?;

        let (entry_id, file) = match response {
            FetchResponse::Invalid { error } => return Err(map_origin_error(error)),

            FetchResponse::Chunk { version, bytes, .. } if mode == OpenMode::CreateNew => {
                let filename = base_filename(&rel, version);
                let disk_path = guard.disk_path(&filename);
                tokio::fs::write(&disk_path, &bytes).await.map_err(|_| Errno::Perm)?;

                let entry = CacheEntry::new(rel.clone(), filename, version, bytes.len() as u64, true);
                let id = guard.insert(entry).await.map_err(|_| Errno::Busy)?;
                guard.incref(id);
                guard.remove_stale(&rel).await;

                let file = open_read_only(&disk_path).await?;
                (id, file)
            }

            FetchResponse::UpToDate { .. } if local.is_some() => {
                let id = local.expect("checked is_some above");
                let disk_path = guard.disk_path(&guard.entry(id).filename.clone());
                let file = open_read_only(&disk_path).await?;
                guard.incref(id);
                guard.touch(id);
                (id, file)
            }

            FetchResponse::UpToDate { .. } => {
                warn!(path = ?rel, "origin reported up-to-date with no local copy");
                return Err(Errno::Perm);
            }

            FetchResponse::Chunk { version, file_size, bytes } => {
                let filename = base_filename(&rel, version);
                let disk_path = guard.disk_path(&filename);
                let mut file = tokio::fs::File::create(&disk_path).await.map_err(|_| Errno::Perm)?;
                file.write_all(&bytes).await.map_err(|_| Errno::Perm)?;

                let mut received = bytes.len() as u64;
                while received < file_size {
                    let resp = self
                        .origin
                        .fetch(&rel, mode, known_version, received)
                        .await
                        .map_err(|_| Errno::Perm)?;
                    let chunk = match resp {
                        FetchResponse::Chunk { bytes, .. } => bytes,
                        _ => return Err(Errno::Perm),
                    };
                    if chunk.is_empty() {
                        break;
                    }
                    file.write_all(&chunk).await.map_err(|_| Errno::Perm)?;
                    received += chunk.len() as u64;
                }
                file.flush().await.map_err(|_| Errno::Perm)?;
                drop(file);

                let entry = CacheEntry::new(rel.clone(), filename, version, received, true);
                let id = guard.insert(entry).await.map_err(|_| Errno::Busy)?;
                guard.incref(id);
                guard.remove_stale(&rel).await;

                let file = open_read_only(&disk_path).await?;
                (id, file)
            }
        };

        drop(guard);

        let access_mode = if mode == OpenMode::Read { AccessMode::Read } else { AccessMode::Write };
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(
            handle,
            HandleState { entry: entry_id, path: rel, access_mode, file, position: 0, writer_private: false },
        );
        Ok(handle)
    }

    /// Read into `buf` from the handle's current position.
    pub async fn read(&mut self, handle: Handle, buf: &mut [u8]) -> Result<usize, Errno> {
        let state = self.handles.get_mut(&handle).ok_or(Errno::BadFd)?;
        state.file.seek(SeekFrom::Start(state.position)).await.map_err(|_| Errno::Perm)?;
        let n = state.file.read(buf).await.map_err(|_| Errno::Perm)?;
        state.position += n as u64;
        let entry_id = state.entry;

        self.cache.lock().await.touch(entry_id);
        Ok(n)
    }

    /// Write `bytes` at the handle's current position, copy-on-writing a
    /// private entry on first write.
    pub async fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize, Errno> {
        let access_mode =
            self.handles.get(&handle).map(|s| s.access_mode).ok_or(Errno::BadFd)?;
        if access_mode == AccessMode::Read {
            return Err(Errno::BadFd);
        }

        let needs_cow = !self.handles[&handle].writer_private;
        if needs_cow {
            self.copy_on_write(handle).await?;
        }

        let state = self.handles.get_mut(&handle).unwrap();
        state.file.seek(SeekFrom::Start(state.position)).await.map_err(|_| Errno::Perm)?;
        state.file.write_all(bytes).await.map_err(|_| Errno::Perm)?;
        state.position += bytes.len() as u64;
        let new_size = state.file.metadata().await.map_err(|_| Errno::Perm)?.len();
        let entry_id = state.entry;

        self.cache.lock().await.update_size(entry_id, new_size).await.map_err(|_| Errno::Busy)?;
        Ok(bytes.len())
    }

    async fn copy_on_write(&mut self, handle: Handle) -> Result<(), Errno> {
        let (old_entry, path, position) = {
            let state = self.handles.get(&handle).expect("handle checked by caller");
            (state.entry, state.path.clone(), state.position)
        };

        let mut guard = self.cache.lock().await;
        let old_filename = guard.entry(old_entry).filename.clone();
        let size = guard.entry(old_entry).size;
        let new_filename = format!("{old_filename}_write_{handle}");
        let old_disk = guard.disk_path(&old_filename);
        let new_disk = guard.disk_path(&new_filename);
        drop(guard);

        chunked_copy(&old_disk, &new_disk).await?;

        let mut guard = self.cache.lock().await;
        let new_entry = CacheEntry::new(path, new_filename, UNKNOWN_VERSION, size, false);
        let new_id = match guard.insert(new_entry).await {
            Ok(id) => id,
            Err(_) => {
                drop(guard);
                let _ = tokio::fs::remove_file(&new_disk).await;
                return Err(Errno::Busy);
            }
        };
        guard.incref(new_id);
        guard.decref(old_entry);
        drop(guard);

        let new_file =
            OpenOptions::new().read(true).write(true).open(&new_disk).await.map_err(|_| Errno::Perm)?;

        let state = self.handles.get_mut(&handle).expect("handle checked by caller");
        state.entry = new_id;
        state.file = new_file;
        state.writer_private = true;
        state.position = position;
        Ok(())
    }

    /// Close `handle`. If it owns a writer-private entry, its content is
    /// streamed back to the origin and committed; the handle is always
    /// released from the table even if propagation fails.
    pub async fn close(&mut self, handle: Handle) -> Result<(), Errno> {
        let mut state = self.handles.remove(&handle).ok_or(Errno::BadFd)?;

        let result = self.commit_if_dirty(&mut state).await;

        let mut guard = self.cache.lock().await;
        guard.touch(state.entry);
        guard.decref(state.entry);
        drop(guard);

        if let Err(err) = &result {
            warn!(path = ?state.path, %err, "close failed to propagate write-back");
        }
        result
    }

    async fn commit_if_dirty(&self, state: &mut HandleState) -> Result<(), Errno> {
        if !state.writer_private {
            return Ok(());
        }

        state.file.seek(SeekFrom::Start(0)).await.map_err(|_| Errno::Perm)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        let mut version = None;
        loop {
            let n = state.file.read(&mut buf).await.map_err(|_| Errno::Perm)?;
            if n == 0 {
                break;
            }
            let outcome =
                self.origin.write(&state.path, &buf[..n], offset).await.map_err(|_| Errno::Perm)?;
            version = Some(outcome.map_err(map_origin_error)?);
            offset += n as u64;
        }
        if version.is_none() {
            // the writer-private copy may be empty (e.g. created then never
            // written past position 0); still commit a zero-length write so
            // the origin bumps the version and records the file.
            let outcome = self.origin.write(&state.path, &[], 0).await.map_err(|_| Errno::Perm)?;
            version = Some(outcome.map_err(map_origin_error)?);
        }
        let version = version.expect("set on every path above");

        let mut guard = self.cache.lock().await;
        let old_filename = guard.entry(state.entry).filename.clone();
        let new_filename = base_filename(&state.path, version);
        let old_disk = guard.disk_path(&old_filename);
        let new_disk = guard.disk_path(&new_filename);
        tokio::fs::rename(&old_disk, &new_disk).await.map_err(|_| Errno::Perm)?;
        guard.mark_readable(state.entry, version, new_filename);
        guard.remove_stale(&state.path).await;

        info!(path = ?state.path, version, "committed write-back to origin");
        Ok(())
    }

    /// Reposition `handle`. `Whence::End` is resolved against the entry's
    /// tracked size.
    pub async fn lseek(&mut self, handle: Handle, pos: i64, whence: Whence) -> Result<u64, Errno> {
        if !self.handles.contains_key(&handle) {
            return Err(Errno::BadFd);
        }
        let current_position = self.handles[&handle].position;
        let entry_id = self.handles[&handle].entry;

        let base: i64 = match whence {
            Whence::Start => 0,
            Whence::Current => current_position as i64,
            Whence::End => self.cache.lock().await.entry(entry_id).size as i64,
        };

        let target = base.checked_add(pos).ok_or(Errno::Inval)?;
        if target < 0 {
            return Err(Errno::Inval);
        }
        let target = target as u64;

        let state = self.handles.get_mut(&handle).unwrap();
        state.file.seek(SeekFrom::Start(target)).await.map_err(|_| Errno::Perm)?;
        state.position = target;

        self.cache.lock().await.touch(entry_id);
        Ok(target)
    }

    /// Delegate removal to the origin. Cache copies are invalidated lazily,
    /// on the next `open`'s version check.
    pub async fn unlink(&mut self, path: &Path) -> Result<(), Errno> {
        let rel = normalize_path(path).ok_or(Errno::Perm)?;
        match self.origin.unlink(&rel).await.map_err(|_| Errno::Perm)? {
            Ok(()) => Ok(()),
            Err(error) => Err(map_origin_error(error)),
        }
    }

    /// Close every still-open handle (propagating dirty data) and clear all
    /// session state. Called when the client disconnects.
    pub async fn clientdone(&mut self) {
        let open_handles: Vec<Handle> = self.handles.keys().copied().collect();
        for handle in open_handles {
            let _ = self.close(handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::OriginServer;

    fn fixture() -> (Arc<Cache>, Arc<dyn Origin>, tempfile::TempDir, tempfile::TempDir) {
        let cache_dir = tempfile::tempdir().unwrap();
        let origin_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(cache_dir.path().to_path_buf(), 10 * 1024 * 1024));
        let origin: Arc<dyn Origin> = Arc::new(OriginServer::new(origin_dir.path().to_path_buf()));
        (cache, origin, cache_dir, origin_dir)
    }

    #[tokio::test]
    async fn create_write_read_close_roundtrip() {
        let (cache, origin, _cd, _od) = fixture();
        let mut session = Session::new(cache, origin);

        let h = session.open(Path::new("foo"), OpenMode::CreateNew).await.unwrap();
        assert_eq!(session.write(h, b"hello").await.unwrap(), 5);
        session.lseek(h, 0, Whence::Start).await.unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(session.read(h, &mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");
        session.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn reopen_after_close_sees_committed_version_without_retransfer() {
        let (cache, origin, _cd, _od) = fixture();
        let mut a = Session::new(cache.clone(), origin.clone());

        let h = a.open(Path::new("bar"), OpenMode::CreateNew).await.unwrap();
        a.write(h, b"1234").await.unwrap();
        a.close(h).await.unwrap();

        let mut b = Session::new(cache, origin);
        let h2 = b.open(Path::new("bar"), OpenMode::Read).await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(h2, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"1234");
    }

    #[tokio::test]
    async fn path_escape_is_rejected_without_rpc() {
        let (cache, origin, _cd, _od) = fixture();
        let mut session = Session::new(cache, origin);
        let err = session.open(Path::new("../etc/passwd"), OpenMode::Read).await.unwrap_err();
        assert_eq!(err, Errno::Perm);
    }

    #[tokio::test]
    async fn read_only_handle_cannot_write() {
        let (cache, origin, _cd, _od) = fixture();
        let mut writer = Session::new(cache.clone(), origin.clone());
        let h = writer.open(Path::new("ro"), OpenMode::CreateNew).await.unwrap();
        writer.write(h, b"data").await.unwrap();
        writer.close(h).await.unwrap();

        let mut reader = Session::new(cache, origin);
        let rh = reader.open(Path::new("ro"), OpenMode::Read).await.unwrap();
        let err = reader.write(rh, b"oops").await.unwrap_err();
        assert_eq!(err, Errno::BadFd);
    }

    #[tokio::test]
    async fn last_writer_wins_on_concurrent_close() {
        let (cache, origin, _cd, _od) = fixture();
        let mut setup = Session::new(cache.clone(), origin.clone());
        let h = setup.open(Path::new("baz"), OpenMode::CreateNew).await.unwrap();
        setup.write(h, b"AAAA").await.unwrap();
        setup.close(h).await.unwrap();

        let mut a = Session::new(cache.clone(), origin.clone());
        let mut b = Session::new(cache.clone(), origin.clone());
        let ha = a.open(Path::new("baz"), OpenMode::Write).await.unwrap();
        let hb = b.open(Path::new("baz"), OpenMode::Write).await.unwrap();

        a.write(ha, b"1111").await.unwrap();
        b.write(hb, b"2222").await.unwrap();

        a.close(ha).await.unwrap();
        b.close(hb).await.unwrap();

        let mut reader = Session::new(cache, origin);
        let rh = reader.open(Path::new("baz"), OpenMode::Read).await.unwrap();
        let mut buf = [0u8; 4];
        reader.read(rh, &mut buf).await.unwrap();
        assert_eq!(&buf, b"2222");
    }
}
