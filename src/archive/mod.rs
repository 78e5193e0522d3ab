//! Read-only access to a Debian-style package archive.
//!
//! Everything under `dists/` and `pool/` is input: package indices,
//! translation indices, the Contents file and the binary packages
//! themselves. Nothing in this module ever writes to the archive.

pub mod contents;
pub mod deb;
pub mod index;

use std::path::PathBuf;
use thiserror::Error;

/// Archive or payload I/O failure.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt archive '{path}': {reason}")]
    Corrupt { path: String, reason: String },
    #[error("'{0}' not found in package payload")]
    NotFound(String),
    #[error("package index not found: {0}")]
    IndexMissing(PathBuf),
    #[error("contents index not found: {0}")]
    ContentsMissing(PathBuf),
}

impl ReadError {
    pub fn corrupt(path: impl Into<String>, reason: impl ToString) -> Self {
        ReadError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
