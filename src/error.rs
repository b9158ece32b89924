//! Flat, non-recoverable error taxonomy for the file system core.
//!
//! Above the `Process` syscall boundary this collapses to `-1`/`false`;
//! internally it stays a typed `Result` so the plumbing between layers
//! (cache -> inode -> path -> fd) can match on failure modes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum FsError {
    /// The free-map has no sectors left, or an in-memory table is full.
    #[error("allocation failed: no free sectors or table slots available")]
    AllocationFailed,

    /// A path component did not resolve to an existing directory entry,
    /// or resolved through a non-directory.
    #[error("path component not found or not a directory")]
    NotFound,

    /// A name was empty, exceeded `NAME_MAX`, or already existed where
    /// uniqueness is required.
    #[error("invalid or duplicate name")]
    InvalidName,

    /// A directory `remove` was attempted on a non-empty directory, the
    /// root directory, or the caller's current working directory.
    #[error("directory is non-empty, is root, or is the current working directory")]
    DirectoryNotRemovable,

    /// A descriptor was out of range, unallocated, or the wrong kind
    /// (e.g. `read` on a directory fd, `readdir` on a file fd).
    #[error("file descriptor invalid or wrong kind for this operation")]
    BadDescriptor,

    /// The process file descriptor table has no empty slot.
    #[error("file descriptor table is full")]
    TooManyOpenFiles,
}

pub type FsResult<T> = Result<T, FsError>;
