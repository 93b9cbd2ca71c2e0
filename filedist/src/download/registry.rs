//! Registry of in-flight downloads.
//!
//! The registry is the single shared mutable structure of the engine. One
//! mutex guards both the pending map and the progress map, so
//! lookup-or-create is atomic and the invariant "at most one pending
//! download per fingerprint" can never be raced into violation.
//!
//! Each entry owns a one-shot completion cell and hands out a cloneable
//! [`SharedDownload`] future. The requester and the push receiver complete
//! the cell from their own tasks; any number of callers await the shared
//! future and all observe the same outcome.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::DownloadError;
use crate::reference::{DownloadRequest, Fingerprint};

/// Outcome of one download, fanned out to every waiting caller.
pub type DownloadResult = Result<PathBuf, DownloadError>;

/// Cloneable future resolving to a download's outcome.
pub type SharedDownload = Shared<BoxFuture<'static, DownloadResult>>;

/// Build an already-resolved [`SharedDownload`], used for local store hits.
pub(crate) fn resolved_download(result: DownloadResult) -> SharedDownload {
    futures::future::ready(result).boxed().shared()
}

/// One in-flight download: the request that started it, the completion
/// cell, and the future shared by all callers.
///
/// Owned by the [`DownloadRegistry`] from creation until whichever event
/// resolves it (push success, failure, timeout) removes it.
pub struct PendingDownload {
    request: DownloadRequest,
    completer: Mutex<Option<oneshot::Sender<DownloadResult>>>,
    future: SharedDownload,
}

impl PendingDownload {
    fn new(request: DownloadRequest) -> Arc<Self> {
        let (tx, rx) = oneshot::channel::<DownloadResult>();
        // A dropped sender can only mean the downloader shut down without
        // completing the cell.
        let future = rx
            .map(|received| received.unwrap_or(Err(DownloadError::Aborted)))
            .boxed()
            .shared();
        Arc::new(Self {
            request,
            completer: Mutex::new(Some(tx)),
            future,
        })
    }

    /// The request that created this entry.
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// The fingerprint being downloaded.
    pub fn fingerprint(&self) -> &Fingerprint {
        self.request.fingerprint()
    }

    /// A future every caller can await; all clones resolve identically.
    pub fn future(&self) -> SharedDownload {
        self.future.clone()
    }

    /// Complete the download exactly once. Returns false if it was already
    /// completed, in which case `result` is discarded.
    pub fn complete(&self, result: DownloadResult) -> bool {
        match self.completer.lock().take() {
            Some(tx) => {
                // Send can only fail if no future clone is alive, which is
                // fine: the result is still observable via `future()`
                // because Shared keeps the receiver.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    pending: HashMap<Fingerprint, Arc<PendingDownload>>,
    /// Last known progress per fingerprint, in [0.0, 1.0]. Entries are
    /// retained after completion so status reads stay meaningful.
    progress: HashMap<Fingerprint, f64>,
}

/// Process-wide, thread-safe map from fingerprint to in-flight download.
#[derive(Default)]
pub struct DownloadRegistry {
    inner: Mutex<RegistryInner>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically return the existing entry for the request's fingerprint
    /// or insert a new one. The boolean is true when a new entry was
    /// created — the one point where a network download may be triggered.
    pub fn get_or_create(&self, request: &DownloadRequest) -> (Arc<PendingDownload>, bool) {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.pending.get(request.fingerprint()) {
            return (Arc::clone(existing), false);
        }
        let pending = PendingDownload::new(request.clone());
        inner
            .pending
            .insert(request.fingerprint().clone(), Arc::clone(&pending));
        inner
            .progress
            .entry(request.fingerprint().clone())
            .or_insert(0.0);
        debug!(fingerprint = %request.fingerprint(), "registered pending download");
        (pending, true)
    }

    /// The pending download for a fingerprint, if one is in flight.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<PendingDownload>> {
        self.inner.lock().pending.get(fingerprint).cloned()
    }

    /// Remove and return a pending download.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<Arc<PendingDownload>> {
        self.inner.lock().pending.remove(fingerprint)
    }

    /// True iff a download is currently in flight for the fingerprint.
    pub fn is_downloading(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.lock().pending.contains_key(fingerprint)
    }

    /// Raise the recorded progress for a fingerprint. Values never
    /// decrease; lower reports are ignored.
    pub fn set_progress(&self, fingerprint: &Fingerprint, value: f64) {
        let value = value.clamp(0.0, 1.0);
        let mut inner = self.inner.lock();
        let entry = inner.progress.entry(fingerprint.clone()).or_insert(0.0);
        if value > *entry {
            *entry = value;
        }
    }

    /// Snapshot of known progress values, safe to take while downloads
    /// mutate the registry concurrently.
    pub fn progress(&self) -> HashMap<Fingerprint, f64> {
        self.inner.lock().progress.clone()
    }

    /// Remove and return every pending download, for shutdown.
    pub fn drain(&self) -> Vec<Arc<PendingDownload>> {
        self.inner.lock().pending.drain().map(|(_, v)| v).collect()
    }
}
