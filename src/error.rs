//! Named error variants for the cache pipeline.
//!
//! Most functions in this crate return `anyhow::Result`; the variants here
//! cover the failures callers need to distinguish programmatically. They are
//! attached to the `anyhow` chain and can be recovered with
//! `err.downcast_ref::<IndexError>()`.
//!
//! Transient IO (a missing file or folder) is never represented here: the
//! lowest layers normalize absence to sentinel values, so upper layers only
//! ever see these fatal cases.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    /// Lock acquisition exhausted its retry budget. The lock may still be
    /// held; the caller must not assume the resource is free.
    #[error("timed out acquiring build lock for project '{project_key}' after {attempts} attempts")]
    LockTimeout { project_key: String, attempts: u32 },

    /// A persisted artifact exists but could not be parsed. Propagated
    /// unmodified — never treated as an empty cache, to avoid masking data
    /// loss.
    #[error("corrupt persisted artifact at {path}: {reason}")]
    CorruptPersisted { path: String, reason: String },

    /// Two vectors of different dimensionality were compared. This is a
    /// contract violation, not a runtime condition to recover from.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}
