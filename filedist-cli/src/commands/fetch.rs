//! `filedist fetch` - download one artifact from HTTP servers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

use filedist::{
    Connection, DownloadConfig, DownloadManager, DownloadRequest, Fingerprint, HttpConnection,
    RoundRobinSource,
};

use super::CommandError;

pub fn run(
    dir: &Path,
    fingerprint: &str,
    servers: &[String],
    timeout_secs: u64,
    retry_interval_secs: u64,
) -> Result<(), CommandError> {
    let fingerprint = Fingerprint::new(fingerprint)?;
    let config = DownloadConfig::new(dir)
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_retry_interval(Duration::from_secs(retry_interval_secs));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(fetch(config, fingerprint, servers))
}

async fn fetch(
    config: DownloadConfig,
    fingerprint: Fingerprint,
    servers: &[String],
) -> Result<(), CommandError> {
    let urls = servers.to_vec();
    let manager = Arc::new(DownloadManager::new(config, move |receiver| {
        let connections: Vec<Arc<dyn Connection>> = urls
            .iter()
            .map(|url| {
                // clap guarantees at least one URL; client construction only
                // fails on a broken TLS backend.
                Arc::new(
                    HttpConnection::new(url.clone(), Arc::clone(&receiver))
                        .expect("failed to create HTTP client"),
                ) as Arc<dyn Connection>
            })
            .collect();
        Arc::new(RoundRobinSource::new(connections).expect("no servers configured"))
    })?);

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40}] {pos:>3}%")
            .expect("static progress template")
            .progress_chars("=> "),
    );
    bar.set_message(fingerprint.to_string());

    let poll = {
        let manager = Arc::clone(&manager);
        let bar = bar.clone();
        let fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            loop {
                if let Some(value) = manager.download_status().get(&fingerprint) {
                    bar.set_position((value * 100.0) as u64);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };

    let request = DownloadRequest::new(fingerprint.clone());
    let result = manager.get_file(request).await;
    poll.abort();
    bar.finish_and_clear();

    match result? {
        Some(path) => {
            debug!(%fingerprint, path = %path.display(), "fetch complete");
            println!("{}", path.display());
            Ok(())
        }
        None => Err(format!("download of {fingerprint} failed or timed out").into()),
    }
}
