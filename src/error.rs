//! Defines the fixed [`Errno`] surface returned by client-facing operations.

use std::fmt;

/// Errors returned by the client API (`open`, `read`, `write`, `lseek`, `unlink`, ...).
///
/// The variant set and their meaning are a stable contract shared with clients;
/// new variants must not be added casually.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// Operation not permitted (path escapes the cache root, or a local I/O
    /// failure occurred while satisfying the request).
    Perm,
    /// No such file or directory.
    NoEnt,
    /// File already exists (`CREATE_NEW` on an existing path).
    Exist,
    /// Is a directory.
    IsDir,
    /// Invalid argument (bad `whence`, negative resulting offset, ...).
    Inval,
    /// Bad file descriptor (handle unknown, or read-only handle used for write).
    BadFd,
    /// Resource busy (cache cannot free enough space to satisfy the request).
    Busy,
    /// Out of memory.
    NoMem,
}

impl Errno {
    /// The negative integer this errno maps to on the wire, mirroring the
    /// usual POSIX convention of returning `-errno` from a syscall-shaped API.
    pub fn code(self) -> i32 {
        -(match self {
            Errno::Perm => 1,
            Errno::NoEnt => 2,
            Errno::Exist => 17,
            Errno::IsDir => 21,
            Errno::Inval => 22,
            Errno::BadFd => 9,
            Errno::Busy => 16,
            Errno::NoMem => 12,
        })
    }

    /// Recover an [`Errno`] from its wire tag. Returns `None` for unknown tags.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Errno::Perm,
            1 => Errno::NoEnt,
            2 => Errno::Exist,
            3 => Errno::IsDir,
            4 => Errno::Inval,
            5 => Errno::BadFd,
            6 => Errno::Busy,
            7 => Errno::NoMem,
            _ => return None,
        })
    }

    /// The wire tag for this errno.
    pub fn tag(self) -> u8 {
        match self {
            Errno::Perm => 0,
            Errno::NoEnt => 1,
            Errno::Exist => 2,
            Errno::IsDir => 3,
            Errno::Inval => 4,
            Errno::BadFd => 5,
            Errno::Busy => 6,
            Errno::NoMem => 7,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Perm => "EPERM",
            Errno::NoEnt => "ENOENT",
            Errno::Exist => "EEXIST",
            Errno::IsDir => "EISDIR",
            Errno::Inval => "EINVAL",
            Errno::BadFd => "EBADF",
            Errno::Busy => "EBUSY",
            Errno::NoMem => "ENOMEM",
        };
        f.write_str(name)
    }
}

impl std::error::Error for Errno {}

/// Result alias used throughout the proxy's client-facing surface.
pub type Result<T> = std::result::Result<T, Errno>;
