//! Defines the typed RPC surface to the origin server --- [`Origin`].
//!
//! Three operations are exposed to [`crate::session::Session`]: `fetch`,
//! `write`, `unlink`. All are blocking request/response; a transport error is
//! surfaced as [`Error::Transport`], never silently swallowed.

mod origin_server;
mod tcp;

use async_trait::async_trait;
use std::path::Path;

use crate::session::OpenMode;

pub use origin_server::OriginServer;
pub use tcp::TcpOrigin;

/// Maximum size of a single fetch/write chunk, fixed and identical on both sides.
pub const CHUNK_SIZE: usize = 400_000;

/// Origin-side error, reported back as an [`crate::error::Errno`] by the
/// caller; this is a strict subset of the fixed errno surface, since the
/// origin only ever rejects opens and unlinks for these reasons.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OriginError {
    Perm,
    NoEnt,
    Exist,
    IsDir,
}

/// Result of [`Origin::fetch`].
#[derive(Debug, Clone)]
pub enum FetchResponse {
    /// Origin-side error (path invalid, EISDIR, EEXIST for CREATE_NEW, ENOENT, EPERM).
    Invalid { error: OriginError },
    /// `known_version` matched the current server version; no bytes transferred.
    UpToDate { version: i64 },
    /// One chunk of the file. `bytes.len() <= CHUNK_SIZE`. Callers re-issue
    /// with successive `offset`s until accumulated length equals `file_size`.
    Chunk { version: i64, file_size: u64, bytes: Vec<u8> },
}

/// Error produced by the RPC transport itself, as opposed to an origin-side
/// rejection (which is conveyed as a normal [`FetchResponse::Invalid`] or
/// [`Err(OriginError)`] value).
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Typed request/response RPC client to the origin server.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetch a chunk of `path` starting at `offset`, given the client's
    /// currently-cached `known_version` (or `-1` if nothing is cached).
    async fn fetch(
        &self,
        path: &Path,
        mode: OpenMode,
        known_version: i64,
        offset: u64,
    ) -> Result<FetchResponse>;

    /// Write `bytes` at `offset`. `offset == 0` signals the first chunk of a
    /// close's write-back; the origin bumps the path's version exactly once
    /// per such session and returns the new version on every chunk.
    async fn write(
        &self,
        path: &Path,
        bytes: &[u8],
        offset: u64,
    ) -> Result<std::result::Result<i64, OriginError>>;

    /// Delete `path` on the origin, bumping its version.
    async fn unlink(&self, path: &Path) -> Result<std::result::Result<(), OriginError>>;
}
