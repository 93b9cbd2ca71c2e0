//! FileDist - content-addressed artifact distribution for cluster nodes.
//!
//! Clients request an immutable artifact by its content fingerprint; the
//! engine fetches it over the network at most once per fingerprint even
//! under concurrent callers, retries against alternate servers on transient
//! failures, bounds every wait, and places the final file atomically so
//! partially written data is never observed.
//!
//! The public entry point is [`download::DownloadManager`]; see that
//! module's documentation for the component layout.

pub mod config;
pub mod connection;
pub mod download;
pub mod logging;
pub mod reference;
pub mod store;

pub use config::{DownloadConfig, DEFAULT_RETRY_INTERVAL, DEFAULT_TIMEOUT};
pub use connection::{
    Connection, ConnectionError, ConnectionSource, HttpConnection, RequestReply,
    RoundRobinSource,
};
pub use download::{
    DownloadError, DownloadManager, FileMetadata, PayloadKind, PushReceiver, ReceiveError,
    SharedDownload,
};
pub use reference::{DownloadRequest, Fingerprint, InvalidFingerprint};
pub use store::{ArtifactStore, StoreError};
