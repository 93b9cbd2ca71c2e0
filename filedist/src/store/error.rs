//! Artifact store error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from the local artifact store.
///
/// The corruption variants indicate the store itself is damaged (an
/// artifact directory exists without a usable file) and require operator
/// attention; they are deliberately distinct from "not downloaded".
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to create a store directory.
    #[error("failed to create store directory {path}: {source}")]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// I/O failure while reading or writing under the store root.
    #[error("i/o error under {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// An artifact directory exists but contains no files.
    #[error("artifact directory {path} exists but contains no files")]
    EmptyArtifactDir { path: PathBuf },

    /// An artifact file exists but cannot be opened for reading.
    #[error("artifact file {path} exists but is not readable: {source}")]
    Unreadable { path: PathBuf, source: io::Error },

    /// An artifact file exists but is zero-length.
    #[error("artifact file {path} exists but is empty")]
    EmptyFile { path: PathBuf },

    /// A pushed artifact file name is not a plain file name.
    #[error("illegal artifact file name {name:?}")]
    InvalidFileName { name: String },
}

impl StoreError {
    /// True for errors that mean the store holds damaged data, as opposed
    /// to transient I/O trouble or bad input.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::EmptyArtifactDir { .. }
                | StoreError::Unreadable { .. }
                | StoreError::EmptyFile { .. }
        )
    }
}
