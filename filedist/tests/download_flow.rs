//! End-to-end tests for the download engine.
//!
//! These tests wire a real `DownloadManager` to fake server connections
//! that exercise the full flow: request with failover, asynchronous push
//! through the receiver, atomic placement, and shared-future fan-out.
//!
//! Run with: `cargo test --test download_flow`

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;

use filedist::{
    Connection, ConnectionError, DownloadConfig, DownloadError, DownloadManager,
    DownloadRequest, FileMetadata, Fingerprint, PushReceiver, RequestReply, RoundRobinSource,
};

// ============================================================================
// Fake Servers
// ============================================================================

/// What one fake server does with a file request.
enum ServerBehavior {
    /// Fail at the transport level, as a down server would.
    Unreachable,
    /// Accept and then push the file through the receiver, chunked.
    Push {
        file_name: &'static str,
        content: Vec<u8>,
        delay: Duration,
        chunk_delay: Duration,
    },
    /// Accept and never deliver anything.
    Silent,
}

struct FakeServer {
    address: String,
    behavior: ServerBehavior,
    receiver: Arc<PushReceiver>,
    requests: AtomicUsize,
}

impl FakeServer {
    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Connection for FakeServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn request_file<'a>(
        &'a self,
        request: &'a DownloadRequest,
    ) -> BoxFuture<'a, Result<RequestReply, ConnectionError>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            ServerBehavior::Unreachable => {
                async { Err(ConnectionError::Transport("connection refused".into())) }.boxed()
            }
            ServerBehavior::Silent => async { Ok(RequestReply::Queued) }.boxed(),
            ServerBehavior::Push {
                file_name,
                content,
                delay,
                chunk_delay,
            } => {
                let receiver = Arc::clone(&self.receiver);
                let fingerprint = request.fingerprint().clone();
                let file_name = file_name.to_string();
                let content = content.clone();
                let delay = *delay;
                let chunk_delay = *chunk_delay;
                async move {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let meta = FileMetadata::new(file_name, content.len() as u64);
                        if receiver.receive_meta(&fingerprint, meta).is_err() {
                            return;
                        }
                        for chunk in content.chunks(content.len().div_ceil(4).max(1)) {
                            if receiver.receive_part(&fingerprint, chunk).is_err() {
                                return;
                            }
                            tokio::time::sleep(chunk_delay).await;
                        }
                        let _ = receiver.receive_eof(&fingerprint);
                    });
                    Ok(RequestReply::Queued)
                }
                .boxed()
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Cluster {
    _dir: TempDir,
    manager: Arc<DownloadManager>,
    servers: Vec<Arc<FakeServer>>,
}

/// Build a manager wired to fake servers, with test-friendly timing.
fn cluster(behaviors: Vec<(&str, ServerBehavior)>) -> Cluster {
    let dir = TempDir::new().unwrap();
    let config = DownloadConfig::new(dir.path().join("store"))
        .with_timeout(Duration::from_millis(800))
        .with_retry_interval(Duration::from_millis(25))
        .with_client_id("test-node");

    let servers_out: Arc<Mutex<Vec<Arc<FakeServer>>>> = Arc::new(Mutex::new(Vec::new()));
    let servers_in = Arc::clone(&servers_out);
    let manager = DownloadManager::new(config, move |receiver| {
        let servers: Vec<Arc<FakeServer>> = behaviors
            .into_iter()
            .map(|(address, behavior)| {
                Arc::new(FakeServer {
                    address: address.to_string(),
                    behavior,
                    receiver: Arc::clone(&receiver),
                    requests: AtomicUsize::new(0),
                })
            })
            .collect();
        *servers_in.lock().unwrap() = servers.clone();
        let connections = servers
            .iter()
            .map(|server| Arc::clone(server) as Arc<dyn Connection>)
            .collect();
        Arc::new(RoundRobinSource::new(connections).unwrap())
    })
    .unwrap();

    let servers = servers_out.lock().unwrap().clone();
    Cluster {
        _dir: dir,
        manager: Arc::new(manager),
        servers,
    }
}

fn fingerprint(value: &str) -> Fingerprint {
    Fingerprint::new(value).unwrap()
}

fn push(content: &[u8]) -> ServerBehavior {
    ServerBehavior::Push {
        file_name: "payload.bin",
        content: content.to_vec(),
        delay: Duration::from_millis(50),
        chunk_delay: Duration::from_millis(5),
    }
}

fn seed_artifact(manager: &DownloadManager, fp: &Fingerprint, name: &str, content: &[u8]) {
    let store = manager.store();
    let staged = store.begin_staging(fp, name).unwrap();
    fs::write(staged.file_path(), content).unwrap();
    store.commit(staged).unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

/// Connection A errors, the requester switches to connection B, B pushes
/// `payload.bin` containing "hello"; the caller sees the file land at
/// `store/abc123/payload.bin`.
#[tokio::test]
async fn test_failover_then_push_delivers_file() {
    let cluster = cluster(vec![
        ("a:19070", ServerBehavior::Unreachable),
        ("b:19070", push(b"hello")),
    ]);

    let path = cluster
        .manager
        .get_file(fingerprint("abc123"))
        .await
        .unwrap()
        .expect("download should succeed via failover");

    assert_eq!(
        path,
        cluster
            .manager
            .store()
            .artifact_dir(&fingerprint("abc123"))
            .join("payload.bin")
    );
    assert_eq!(fs::read(&path).unwrap(), b"hello");
    assert_eq!(cluster.servers[0].requests(), 1);
    assert_eq!(cluster.servers[1].requests(), 1);
    assert!(!cluster.manager.is_downloading(&fingerprint("abc123")));
}

/// An artifact already on disk is served without any RPC, well inside the
/// download timeout.
#[tokio::test]
async fn test_local_artifact_served_without_rpc() {
    let cluster = cluster(vec![("a:19070", push(b"unused"))]);
    let fp = fingerprint("xyz");
    seed_artifact(&cluster.manager, &fp, "model.bin", b"weights");

    let started = std::time::Instant::now();
    let path = cluster.manager.get_file(fp).await.unwrap().unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"weights");
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(cluster.servers[0].requests(), 0);
}

/// N concurrent callers for one absent fingerprint share a single request
/// and a single push, and all observe the same path.
#[tokio::test]
async fn test_concurrent_callers_share_one_download() {
    let cluster = cluster(vec![("a:19070", push(b"shared-content"))]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&cluster.manager);
        handles.push(tokio::spawn(async move {
            manager.get_file(fingerprint("abc123")).await.unwrap()
        }));
    }

    let mut paths = Vec::new();
    for handle in handles {
        paths.push(handle.await.unwrap().expect("every caller should succeed"));
    }

    paths.dedup();
    assert_eq!(paths.len(), 1, "all callers must observe the same path");
    assert_eq!(fs::read(&paths[0]).unwrap(), b"shared-content");
    assert_eq!(cluster.servers[0].requests(), 1);
}

/// Transient failures within the retry budget are invisible to the caller.
#[tokio::test]
async fn test_retries_are_transparent() {
    let cluster = cluster(vec![
        ("a:19070", ServerBehavior::Unreachable),
        ("b:19070", ServerBehavior::Unreachable),
        ("c:19070", push(b"finally")),
    ]);

    let path = cluster
        .manager
        .get_file(fingerprint("abc123"))
        .await
        .unwrap()
        .expect("third connection should deliver");

    assert_eq!(fs::read(&path).unwrap(), b"finally");
    assert!(cluster.servers[0].requests() >= 1);
    assert!(cluster.servers[1].requests() >= 1);
}

/// When no push arrives in time, the caller gets `None` and the registry
/// entry is gone, so nothing claims the fingerprint is still downloading.
#[tokio::test]
async fn test_timeout_returns_none_and_cleans_up() {
    let cluster = cluster(vec![("a:19070", ServerBehavior::Silent)]);
    let fp = fingerprint("slow1");

    let result = cluster.manager.get_file(fp.clone()).await.unwrap();

    assert_eq!(result, None);
    assert!(!cluster.manager.is_downloading(&fp));
    // The artifact never landed.
    assert_eq!(cluster.manager.store().lookup(&fp).unwrap(), None);
}

/// Progress for a fingerprint never decreases across one download, and
/// reaches 1.0 on completion.
#[tokio::test]
async fn test_progress_is_monotonic() {
    let cluster = cluster(vec![(
        "a:19070",
        ServerBehavior::Push {
            file_name: "payload.bin",
            content: vec![7u8; 64 * 1024],
            delay: Duration::from_millis(20),
            chunk_delay: Duration::from_millis(20),
        },
    )]);
    let fp = fingerprint("abc123");

    let future = cluster.manager.get_future_file(fp.clone()).unwrap();

    let mut observed = Vec::new();
    let mut done_future = future;
    loop {
        tokio::select! {
            result = &mut done_future => {
                result.expect("download should succeed");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(5)) => {
                if let Some(value) = cluster.manager.download_status().get(&fp) {
                    observed.push(*value);
                }
            }
        }
    }
    observed.push(cluster.manager.download_status()[&fp]);

    assert!(
        observed.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress must be non-decreasing: {observed:?}"
    );
    assert_eq!(*observed.last().unwrap(), 1.0);
}

/// A second request after a completed download is a pure store hit.
#[tokio::test]
async fn test_second_request_hits_store() {
    let cluster = cluster(vec![("a:19070", push(b"hello"))]);
    let fp = fingerprint("abc123");

    let first = cluster.manager.get_file(fp.clone()).await.unwrap().unwrap();
    let second = cluster.manager.get_file(fp).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(cluster.servers[0].requests(), 1);
}

/// Requests can carry an originating-client tag without changing dedup
/// semantics.
#[tokio::test]
async fn test_tagged_request_downloads_normally() {
    let cluster = cluster(vec![("a:19070", push(b"hello"))]);
    let request = DownloadRequest::new(fingerprint("abc123")).with_client("edge-node-4");

    let path = cluster.manager.get_file(request).await.unwrap().unwrap();
    assert_eq!(fs::read(path).unwrap(), b"hello");
}

/// Closing the manager aborts in-flight downloads promptly instead of
/// leaving callers blocked until their timeout.
#[tokio::test]
async fn test_close_fails_outstanding_downloads() {
    let cluster = cluster(vec![("a:19070", ServerBehavior::Silent)]);

    let future = cluster
        .manager
        .get_future_file(fingerprint("abc123"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = std::time::Instant::now();
    cluster.manager.close();
    assert_eq!(future.await, Err(DownloadError::Aborted));
    assert!(started.elapsed() < Duration::from_millis(100));
}
