//! The file download engine.
//!
//! [`DownloadManager`] is the public entry point: it turns a content
//! fingerprint into a locally available file, fetching over the network at
//! most once per fingerprint no matter how many callers ask concurrently.
//!
//! # Architecture
//!
//! ```text
//! DownloadManager (facade)
//!         │  local store hit? ──► return path, no network
//!         ▼
//! DownloadRegistry ── at most one PendingDownload per fingerprint
//!         │
//!         ├── DownloadRequester ── request/retry/failover driver tasks
//!         │
//!         └── PushReceiver ◄── server push (meta/part/eof)
//!                 │
//!                 └── ArtifactStore ── staging + atomic rename
//! ```
//!
//! Callers that arrive while a download is in flight attach to its shared
//! future; whichever of the receiver, the retry deadline, or `close()`
//! resolves the entry, every caller observes the same outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time;
use tracing::{debug, warn};

mod error;
mod receiver;
mod registry;
mod requester;

pub use error::{DownloadError, ReceiveError};
pub use receiver::{FileMetadata, PayloadKind, PushReceiver};
pub use registry::{DownloadResult, SharedDownload};
pub use requester::DownloadRequester;

use registry::DownloadRegistry;

use crate::config::DownloadConfig;
use crate::connection::ConnectionSource;
use crate::reference::{DownloadRequest, Fingerprint};
use crate::store::{ArtifactStore, StoreError};

/// Facade over the download engine.
///
/// Construction wires the registry, requester, and push receiver around one
/// [`ArtifactStore`]; the connection source is built by a caller-supplied
/// closure so transports that deliver inline can hold the receiver.
pub struct DownloadManager {
    config: DownloadConfig,
    connections: Arc<dyn ConnectionSource>,
    store: Arc<ArtifactStore>,
    registry: Arc<DownloadRegistry>,
    requester: Arc<DownloadRequester>,
    receiver: Arc<PushReceiver>,
    closed: AtomicBool,
}

impl DownloadManager {
    /// Create a manager for the given configuration.
    ///
    /// `make_source` receives the push receiver and returns the connection
    /// source the requester will use.
    pub fn new<F>(config: DownloadConfig, make_source: F) -> Result<Self, StoreError>
    where
        F: FnOnce(Arc<PushReceiver>) -> Arc<dyn ConnectionSource>,
    {
        let store = Arc::new(ArtifactStore::open(config.download_directory.clone())?);
        let registry = Arc::new(DownloadRegistry::new());
        let receiver = Arc::new(PushReceiver::new(Arc::clone(&registry), Arc::clone(&store)));
        let connections = make_source(Arc::clone(&receiver));
        let requester = Arc::new(DownloadRequester::new(
            Arc::clone(&connections),
            Arc::clone(&registry),
            config.timeout,
            config.retry_interval,
            config.client_id.clone(),
        ));
        Ok(Self {
            config,
            connections,
            store,
            registry,
            requester,
            receiver,
            closed: AtomicBool::new(false),
        })
    }

    /// Retrieve an artifact, waiting up to the configured timeout.
    ///
    /// Returns `Ok(None)` on timeout or download failure (the pending entry
    /// is dropped so a later request retries from scratch). Local store
    /// corruption is the one condition that surfaces as an error: it means
    /// the store needs operator attention, not another download attempt.
    pub async fn get_file(
        &self,
        request: impl Into<DownloadRequest>,
    ) -> Result<Option<PathBuf>, StoreError> {
        let request = request.into();
        let fingerprint = request.fingerprint().clone();

        if let Some(path) = self.check_local(&fingerprint)? {
            return Ok(Some(path));
        }

        let future = self.requester.start_download(request);
        match time::timeout(self.config.timeout, future).await {
            Ok(Ok(path)) => Ok(Some(path)),
            Ok(Err(error)) => {
                warn!(%fingerprint, %error, "download failed");
                Ok(None)
            }
            Err(_) => {
                warn!(
                    %fingerprint,
                    timeout = ?self.config.timeout,
                    "download timed out, removing from queue"
                );
                self.requester.fail_download(
                    &fingerprint,
                    DownloadError::Timeout {
                        timeout: self.config.timeout,
                    },
                );
                Ok(None)
            }
        }
    }

    /// Non-blocking retrieval: returns a future that resolves when the
    /// artifact is available (or the download fails).
    ///
    /// A local store hit yields an already-resolved future. Dropping or
    /// timing out the returned future does not cancel the shared download;
    /// it runs until its own deadline.
    pub fn get_future_file(
        &self,
        request: impl Into<DownloadRequest>,
    ) -> Result<SharedDownload, StoreError> {
        let request = request.into();
        match self.check_local(request.fingerprint())? {
            Some(path) => Ok(registry::resolved_download(Ok(path))),
            None => Ok(self.requester.start_download(request)),
        }
    }

    /// Fire-and-forget: start (or attach to) a download unless the artifact
    /// is already present.
    ///
    /// Unlike [`get_file`], a corrupt local entry is logged and
    /// re-downloaded rather than surfaced; the commit path replaces the
    /// damaged directory.
    ///
    /// [`get_file`]: DownloadManager::get_file
    pub fn download_if_needed(&self, request: impl Into<DownloadRequest>) {
        let request = request.into();
        match self.store.lookup(request.fingerprint()) {
            Ok(Some(_)) => {
                self.registry.set_progress(request.fingerprint(), 1.0);
                debug!(fingerprint = %request.fingerprint(), "already downloaded");
            }
            Ok(None) => {
                let _ = self.requester.start_download(request);
            }
            Err(error) => {
                warn!(
                    fingerprint = %request.fingerprint(),
                    %error,
                    "local artifact unusable, downloading again"
                );
                let _ = self.requester.start_download(request);
            }
        }
    }

    /// Snapshot of download progress per fingerprint, in [0.0, 1.0].
    pub fn download_status(&self) -> HashMap<Fingerprint, f64> {
        self.registry.progress()
    }

    /// True iff a download is currently in flight for the fingerprint.
    pub fn is_downloading(&self, fingerprint: &Fingerprint) -> bool {
        self.registry.is_downloading(fingerprint)
    }

    /// The inbound push handler, for wiring into the RPC dispatcher.
    pub fn receiver(&self) -> Arc<PushReceiver> {
        Arc::clone(&self.receiver)
    }

    /// The connection source downloads run against.
    pub fn connections(&self) -> Arc<dyn ConnectionSource> {
        Arc::clone(&self.connections)
    }

    /// The local artifact store.
    pub fn store(&self) -> Arc<ArtifactStore> {
        Arc::clone(&self.store)
    }

    /// The configuration this manager was created with.
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Shut down: abort retry loops, fail outstanding futures, and discard
    /// in-progress transfers. Idempotent; also runs on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("closing download manager");
            self.requester.close();
            self.receiver.shutdown();
        }
    }

    fn check_local(&self, fingerprint: &Fingerprint) -> Result<Option<PathBuf>, StoreError> {
        match self.store.lookup(fingerprint)? {
            Some(path) => {
                self.registry.set_progress(fingerprint, 1.0);
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.close();
    }
}
