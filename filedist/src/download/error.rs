//! Download engine error types.

use std::time::Duration;

use thiserror::Error;

use crate::reference::Fingerprint;

/// Terminal failure of one pending download.
///
/// Cloneable because the same value fans out to every caller sharing the
/// download's future; I/O causes are therefore carried as rendered strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The overall download budget elapsed without the artifact arriving.
    #[error("download timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The downloader was closed while the download was in flight.
    #[error("downloader is shutting down")]
    Aborted,

    /// The server delivery failed partway through.
    #[error("delivery failed: {reason}")]
    Delivery { reason: String },

    /// The delivered payload did not match its declared checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Writing the artifact into the local store failed.
    #[error("failed to store artifact: {reason}")]
    Storage { reason: String },
}

/// Rejection of an inbound push (the "nack" of the push protocol).
///
/// These are returned to the delivering server; apart from logging they do
/// not affect any other in-flight download.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// A push arrived for a fingerprint with no pending download.
    #[error("no download in flight for {0}")]
    Unsolicited(Fingerprint),

    /// A part or eof arrived without a preceding meta.
    #[error("no active transfer for {0}")]
    NoTransfer(Fingerprint),

    /// A second meta arrived while a transfer is already running.
    #[error("transfer already in progress for {0}")]
    TransferInProgress(Fingerprint),

    /// The received byte count does not match the declared size.
    #[error("size mismatch for {fingerprint}: declared {declared}, received {received}")]
    SizeMismatch {
        fingerprint: Fingerprint,
        declared: u64,
        received: u64,
    },

    /// The received payload does not match the declared checksum.
    #[error("checksum mismatch for {fingerprint}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        fingerprint: Fingerprint,
        expected: String,
        actual: String,
    },

    /// Local I/O failure while staging or committing the payload.
    #[error("storage failure for {fingerprint}: {reason}")]
    Storage {
        fingerprint: Fingerprint,
        reason: String,
    },
}

impl ReceiveError {
    /// The download-side rendering of this rejection, used to fail the
    /// pending future when delivery breaks down mid-transfer.
    pub(crate) fn to_download_error(&self) -> DownloadError {
        match self {
            ReceiveError::ChecksumMismatch {
                expected, actual, ..
            } => DownloadError::ChecksumMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            ReceiveError::Storage { reason, .. } => DownloadError::Storage {
                reason: reason.clone(),
            },
            other => DownloadError::Delivery {
                reason: other.to_string(),
            },
        }
    }
}
