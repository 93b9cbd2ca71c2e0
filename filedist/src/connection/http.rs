//! HTTP connection with inline delivery.
//!
//! Some artifact servers answer the request with the payload itself instead
//! of a deferred push. This connection issues `GET {base}/{fingerprint}`
//! and streams the response body through the push receiver, so placement,
//! integrity checking, and progress reporting all follow the one receive
//! path. From the engine's point of view the reply is still `Queued` — by
//! the time the call returns, the pending download has been resolved by the
//! receiver.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::StatusCode;
use tracing::debug;

use super::{Connection, ConnectionError, RequestReply};
use crate::download::{FileMetadata, PushReceiver, ReceiveError};
use crate::reference::DownloadRequest;

/// Default per-request timeout for artifact fetches.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Optional response header declaring the payload's hex SHA-256.
const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// Request header carrying the originating client's identity.
const CLIENT_HEADER: &str = "x-requested-by";

/// A [`Connection`] to an HTTP artifact server.
pub struct HttpConnection {
    address: String,
    client: reqwest::Client,
    receiver: Arc<PushReceiver>,
}

impl HttpConnection {
    /// Connect to `base_url` with the default timeout.
    pub fn new(
        base_url: impl Into<String>,
        receiver: Arc<PushReceiver>,
    ) -> Result<Self, ConnectionError> {
        Self::with_timeout(base_url, receiver, DEFAULT_HTTP_TIMEOUT)
    }

    /// Connect to `base_url` with a custom per-request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        receiver: Arc<PushReceiver>,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ConnectionError::Transport(error.to_string()))?;
        let address = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            address,
            client,
            receiver,
        })
    }

    async fn fetch(&self, request: &DownloadRequest) -> Result<RequestReply, ConnectionError> {
        let fingerprint = request.fingerprint();
        let url = format!("{}/{}", self.address, fingerprint);
        debug!(%fingerprint, url, "fetching artifact");

        let mut http = self.client.get(&url);
        if let Some(client) = request.client() {
            http = http.header(CLIENT_HEADER, client);
        }
        let mut response = http
            .send()
            .await
            .map_err(|error| ConnectionError::Transport(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(RequestReply::NotFound);
        }
        if !status.is_success() {
            return Err(ConnectionError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let file_name = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(attachment_file_name)
            .unwrap_or_else(|| format!("{fingerprint}.bin"));
        let mut meta = FileMetadata::new(file_name, response.content_length().unwrap_or(0));
        if let Some(checksum) = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            meta = meta.with_checksum(checksum);
        }

        let delivery = |error: ReceiveError| ConnectionError::Delivery(error.to_string());
        self.receiver.receive_meta(fingerprint, meta).map_err(delivery)?;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    self.receiver
                        .receive_part(fingerprint, &chunk)
                        .map_err(delivery)?;
                }
                Ok(None) => break,
                Err(error) => {
                    // Free the session so a retry against another
                    // connection can start a fresh transfer.
                    self.receiver.abort_transfer(fingerprint);
                    return Err(ConnectionError::Transport(error.to_string()));
                }
            }
        }
        self.receiver.receive_eof(fingerprint).map_err(delivery)?;

        Ok(RequestReply::Queued)
    }
}

impl Connection for HttpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn request_file<'a>(
        &'a self,
        request: &'a DownloadRequest,
    ) -> BoxFuture<'a, Result<RequestReply, ConnectionError>> {
        self.fetch(request).boxed()
    }
}

/// Extract the file name from a `Content-Disposition: attachment` header.
fn attachment_file_name(header: &str) -> Option<String> {
    let (_, value) = header.split_once("filename=")?;
    let value = value
        .split(';')
        .next()
        .unwrap_or(value)
        .trim()
        .trim_matches('"');
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
