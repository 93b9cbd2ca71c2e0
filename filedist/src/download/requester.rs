//! Outbound request scheduling with retry and failover.
//!
//! One driver task per fingerprint asks servers to deliver the artifact.
//! Attempts rotate through the connection source with a configured sleep
//! between them, bounded by a monotonic deadline; once a server accepts,
//! the driver waits for the push receiver to resolve the download, still
//! under the same deadline. Concurrent requests for a fingerprint attach to
//! the existing entry and never issue a second request.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::registry::{DownloadRegistry, PendingDownload, SharedDownload};
use crate::connection::{ConnectionSource, RequestReply};
use crate::reference::{DownloadRequest, Fingerprint};

/// Issues "request file" calls and owns the per-download driver tasks.
///
/// State lives behind an inner `Arc` shared with the spawned drivers, so
/// the requester itself can be held by value in the facade.
pub struct DownloadRequester {
    inner: Arc<RequesterInner>,
}

struct RequesterInner {
    connections: Arc<dyn ConnectionSource>,
    registry: Arc<DownloadRegistry>,
    timeout: Duration,
    retry_interval: Duration,
    client_id: String,
    cancel: CancellationToken,
}

impl DownloadRequester {
    pub(crate) fn new(
        connections: Arc<dyn ConnectionSource>,
        registry: Arc<DownloadRegistry>,
        timeout: Duration,
        retry_interval: Duration,
        client_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(RequesterInner {
                connections,
                registry,
                timeout,
                retry_interval,
                client_id,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start (or attach to) the download for a request.
    ///
    /// Must be called from within a tokio runtime: creating a new registry
    /// entry spawns the driver task that performs the network operation.
    pub fn start_download(&self, request: DownloadRequest) -> SharedDownload {
        let request = match request.client() {
            Some(_) => request,
            None => {
                let fingerprint = request.fingerprint().clone();
                DownloadRequest::new(fingerprint).with_client(self.inner.client_id.clone())
            }
        };

        let (pending, created) = self.inner.registry.get_or_create(&request);
        let future = pending.future();
        if created {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drive(request, pending).await });
        } else {
            debug!(fingerprint = %request.fingerprint(), "attached to in-flight download");
        }
        future
    }

    /// Abandon a pending download, failing its future with `error`.
    ///
    /// Used by the facade when a bounded wait elapses; the registry entry
    /// is removed so a later request starts over.
    pub fn fail_download(&self, fingerprint: &Fingerprint, error: DownloadError) {
        self.inner.abandon(fingerprint, error);
    }

    /// Stop all retry loops and fail every outstanding download. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        for pending in self.inner.registry.drain() {
            pending.complete(Err(DownloadError::Aborted));
        }
    }
}

impl RequesterInner {
    /// Drive one download to resolution: request with retries, then wait
    /// for the push.
    async fn drive(&self, request: DownloadRequest, pending: Arc<PendingDownload>) {
        let fingerprint = request.fingerprint().clone();
        let deadline = Instant::now() + self.timeout;
        let future = pending.future();

        if !self.request_with_retries(&request, deadline, &future).await {
            return;
        }

        // A server accepted; from here only the receiver (or the deadline)
        // finishes the download.
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.abandon(&fingerprint, DownloadError::Aborted);
            }
            _ = time::sleep_until(deadline) => {
                self.abandon(
                    &fingerprint,
                    DownloadError::Timeout { timeout: self.timeout },
                );
            }
            result = future => {
                if let Ok(path) = result {
                    debug!(%fingerprint, path = %path.display(), "download resolved");
                }
            }
        }
    }

    /// Ask connections to deliver the artifact until one accepts, rotating
    /// on failure. Returns false when the download was finished (or
    /// abandoned) during the loop.
    async fn request_with_retries(
        &self,
        request: &DownloadRequest,
        deadline: Instant,
        future: &SharedDownload,
    ) -> bool {
        let fingerprint = request.fingerprint();
        loop {
            // An inline delivery or a concurrent failure may have resolved
            // the download while we slept.
            if future.peek().is_some() {
                return false;
            }
            if self.cancel.is_cancelled() {
                self.abandon(fingerprint, DownloadError::Aborted);
                return false;
            }

            let connection = self.connections.current();
            match connection.request_file(request).await {
                Ok(RequestReply::Queued) => {
                    debug!(
                        %fingerprint,
                        address = connection.address(),
                        "file request accepted"
                    );
                    return true;
                }
                Ok(RequestReply::NotFound) => {
                    info!(
                        %fingerprint,
                        address = connection.address(),
                        "server does not have file, retrying against next connection"
                    );
                }
                Ok(RequestReply::Rejected(reason)) => {
                    warn!(
                        %fingerprint,
                        address = connection.address(),
                        %reason,
                        "file request rejected"
                    );
                }
                Err(error) => {
                    warn!(
                        %fingerprint,
                        address = connection.address(),
                        %error,
                        "file request failed"
                    );
                }
            }
            self.connections.report_error(connection.as_ref());
            self.connections.rotate();

            let now = Instant::now();
            if now >= deadline {
                self.abandon(
                    fingerprint,
                    DownloadError::Timeout { timeout: self.timeout },
                );
                return false;
            }
            let sleep = self.retry_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.abandon(fingerprint, DownloadError::Aborted);
                    return false;
                }
                result = future.clone() => {
                    // Resolved while mid-retry (e.g. a push from an earlier
                    // attempt landed after all).
                    let _ = result;
                    return false;
                }
                _ = time::sleep(sleep) => {}
            }
        }
    }

    fn abandon(&self, fingerprint: &Fingerprint, error: DownloadError) {
        if let Some(pending) = self.registry.remove(fingerprint) {
            warn!(%fingerprint, %error, "abandoning download");
            pending.complete(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionError, RoundRobinSource};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Connection that replays a scripted list of outcomes, then keeps
    /// returning the last one.
    struct ScriptedConnection {
        address: String,
        calls: AtomicUsize,
        script: Mutex<VecDeque<Result<RequestReply, ConnectionError>>>,
    }

    impl ScriptedConnection {
        fn new(
            address: &str,
            script: Vec<Result<RequestReply, ConnectionError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into_iter().collect()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Connection for ScriptedConnection {
        fn address(&self) -> &str {
            &self.address
        }

        fn request_file<'a>(
            &'a self,
            _request: &'a DownloadRequest,
        ) -> BoxFuture<'a, Result<RequestReply, ConnectionError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };
            let reply = next.unwrap_or(Ok(RequestReply::Queued));
            async move { reply }.boxed()
        }
    }

    fn requester(
        connections: Vec<Arc<dyn Connection>>,
        timeout: Duration,
        retry: Duration,
    ) -> (DownloadRequester, Arc<DownloadRegistry>) {
        let registry = Arc::new(DownloadRegistry::new());
        let source = Arc::new(RoundRobinSource::new(connections).unwrap());
        let requester = DownloadRequester::new(
            source,
            Arc::clone(&registry),
            timeout,
            retry,
            "test-client".to_string(),
        );
        (requester, registry)
    }

    fn request(value: &str) -> DownloadRequest {
        DownloadRequest::new(Fingerprint::new(value).unwrap())
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_rpc() {
        let connection = ScriptedConnection::new("a:19070", vec![Ok(RequestReply::Queued)]);
        let (requester, registry) = requester(
            vec![Arc::clone(&connection) as Arc<dyn Connection>],
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        let futures: Vec<SharedDownload> = (0..8)
            .map(|_| requester.start_download(request("abc123")))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connection.calls(), 1);
        assert!(registry.is_downloading(&Fingerprint::new("abc123").unwrap()));
        drop(futures);
        requester.close();
    }

    #[tokio::test]
    async fn test_times_out_when_no_push_arrives() {
        let connection = ScriptedConnection::new("a:19070", vec![Ok(RequestReply::Queued)]);
        let (requester, registry) = requester(
            vec![connection as Arc<dyn Connection>],
            Duration::from_millis(100),
            Duration::from_millis(10),
        );

        let result = requester.start_download(request("slow1")).await;
        assert!(matches!(result, Err(DownloadError::Timeout { .. })));
        assert!(!registry.is_downloading(&Fingerprint::new("slow1").unwrap()));
    }

    #[tokio::test]
    async fn test_rotates_to_next_connection_on_error() {
        let failing = ScriptedConnection::new(
            "a:19070",
            vec![Err(ConnectionError::Transport("connection refused".into()))],
        );
        let accepting = ScriptedConnection::new("b:19070", vec![Ok(RequestReply::Queued)]);
        let (requester, registry) = requester(
            vec![
                Arc::clone(&failing) as Arc<dyn Connection>,
                Arc::clone(&accepting) as Arc<dyn Connection>,
            ],
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        let fingerprint = Fingerprint::new("abc123").unwrap();
        let _future = requester.start_download(request("abc123"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(failing.calls(), 1);
        assert_eq!(accepting.calls(), 1);
        // Accepted but not yet pushed: still pending.
        assert!(registry.is_downloading(&fingerprint));
        // Resolve via the registry as the receiver would.
        registry
            .remove(&fingerprint)
            .unwrap()
            .complete(Ok(std::path::PathBuf::from("/store/abc123/payload.bin")));
        requester.close();
    }

    #[tokio::test]
    async fn test_retries_are_transparent_to_caller() {
        let flaky = ScriptedConnection::new(
            "a:19070",
            vec![
                Err(ConnectionError::Transport("reset".into())),
                Err(ConnectionError::Transport("reset".into())),
                Ok(RequestReply::Queued),
            ],
        );
        let (requester, registry) = requester(
            vec![Arc::clone(&flaky) as Arc<dyn Connection>],
            Duration::from_secs(5),
            Duration::from_millis(5),
        );

        let fingerprint = Fingerprint::new("abc123").unwrap();
        let future = requester.start_download(request("abc123"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flaky.calls(), 3);

        registry
            .remove(&fingerprint)
            .unwrap()
            .complete(Ok(std::path::PathBuf::from("/store/abc123/payload.bin")));
        let result = future.await.unwrap();
        assert_eq!(result, std::path::PathBuf::from("/store/abc123/payload.bin"));
        requester.close();
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_downloads() {
        let connection = ScriptedConnection::new("a:19070", vec![Ok(RequestReply::Queued)]);
        let (requester, registry) = requester(
            vec![connection as Arc<dyn Connection>],
            Duration::from_secs(60),
            Duration::from_millis(10),
        );

        let future = requester.start_download(request("abc123"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        requester.close();
        requester.close();

        assert_eq!(future.await, Err(DownloadError::Aborted));
        assert!(!registry.is_downloading(&Fingerprint::new("abc123").unwrap()));
    }

    #[tokio::test]
    async fn test_not_found_keeps_retrying_until_deadline() {
        let connection =
            ScriptedConnection::new("a:19070", vec![Ok(RequestReply::NotFound)]);
        let (requester, _registry) = requester(
            vec![Arc::clone(&connection) as Arc<dyn Connection>],
            Duration::from_millis(120),
            Duration::from_millis(20),
        );

        let result = requester.start_download(request("absent")).await;
        assert!(matches!(result, Err(DownloadError::Timeout { .. })));
        assert!(connection.calls() > 2);
    }
}
