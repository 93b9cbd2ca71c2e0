//! Download engine configuration.
//!
//! All tunables are supplied by the embedding application; the engine keeps
//! no process-wide defaults. The constants below document the fallback
//! values used when a caller does not override them.

use std::path::PathBuf;
use std::time::Duration;

/// Default overall budget for one download, covering every retry and the
/// wait for the server push. Long enough for large artifacts on a loaded
/// cluster, short enough that a wedged server does not pin callers forever.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default sleep between request attempts against rotating connections.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for a [`DownloadManager`](crate::download::DownloadManager).
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Root directory of the local artifact store.
    pub download_directory: PathBuf,

    /// Overall per-download budget; when it elapses the pending download is
    /// abandoned and a later request starts from scratch.
    pub timeout: Duration,

    /// Sleep between failed request attempts.
    pub retry_interval: Duration,

    /// Identity sent to servers with every artifact request.
    pub client_id: String,
}

impl DownloadConfig {
    /// Create a config for the given store root with default timing values.
    ///
    /// The client id defaults to the `HOSTNAME` environment variable when
    /// set, `"localhost"` otherwise.
    pub fn new(download_directory: impl Into<PathBuf>) -> Self {
        Self {
            download_directory: download_directory.into(),
            timeout: DEFAULT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            client_id: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// Set the overall per-download timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the sleep between request retries.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Set the client identity sent with artifact requests.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = DownloadConfig::new("/var/lib/filedist");
        assert_eq!(config.download_directory, PathBuf::from("/var/lib/filedist"));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert!(!config.client_id.is_empty());
    }

    #[test]
    fn test_config_builders() {
        let config = DownloadConfig::new("/tmp/store")
            .with_timeout(Duration::from_secs(5))
            .with_retry_interval(Duration::from_millis(250))
            .with_client_id("node-3");
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.client_id, "node-3");
    }
}
