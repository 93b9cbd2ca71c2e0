//! Connection abstraction for talking to artifact servers.
//!
//! The download engine is deliberately ignorant of transport details: it
//! asks a [`ConnectionSource`] for the connection to use, issues one
//! "request file" call through the [`Connection`] trait, and on failure
//! reports the connection and rotates to the next one. Load balancing and
//! health checking beyond that simple failover surface belong to the
//! embedding application.
//!
//! Traits are object-safe (`Arc<dyn Connection>`), using boxed futures for
//! the async call, so sources can mix transport implementations and tests
//! can inject mocks.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::reference::DownloadRequest;

mod http;

pub use http::HttpConnection;

/// Server-side verdict on one "request file" call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestReply {
    /// The server accepted the request and will push the artifact, or has
    /// already delivered it inline.
    Queued,

    /// The server does not currently have the artifact.
    NotFound,

    /// The server refused to serve the request.
    Rejected(String),
}

/// Errors from one request attempt against one connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// A source was constructed with no connections.
    #[error("no connections configured")]
    NoConnections,

    /// The request could not be transported to the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a failing HTTP status.
    #[error("server returned http status {status}")]
    HttpStatus { status: u16 },

    /// The response could not be interpreted.
    #[error("malformed server response: {0}")]
    MalformedResponse(String),

    /// The artifact arrived but the local receive path rejected it.
    #[error("delivery to local receiver failed: {0}")]
    Delivery(String),
}

/// One usable endpoint for requesting artifacts.
pub trait Connection: Send + Sync {
    /// Stable address of the endpoint, used for failover bookkeeping and
    /// logging.
    fn address(&self) -> &str;

    /// Ask the server to make the requested artifact available. A `Queued`
    /// reply means delivery happens through the push receiver (possibly
    /// before this call returns, for inline transports).
    fn request_file<'a>(
        &'a self,
        request: &'a DownloadRequest,
    ) -> BoxFuture<'a, Result<RequestReply, ConnectionError>>;
}

/// Provider of connections with failover.
///
/// The requester never caches a connection across attempts: every attempt
/// takes `current()` fresh, and failed attempts call `report_error` then
/// `rotate`.
pub trait ConnectionSource: Send + Sync {
    /// The connection new attempts should use.
    fn current(&self) -> Arc<dyn Connection>;

    /// Record that an attempt against this connection failed.
    fn report_error(&self, connection: &dyn Connection);

    /// Advance to the next connection and return it.
    fn rotate(&self) -> Arc<dyn Connection>;
}

struct RoundRobinState {
    active: usize,
    errors: Vec<u64>,
}

/// Minimal [`ConnectionSource`]: a fixed connection list walked round-robin
/// on failure, with per-connection error counters.
pub struct RoundRobinSource {
    connections: Vec<Arc<dyn Connection>>,
    state: Mutex<RoundRobinState>,
}

impl RoundRobinSource {
    /// Create a source over the given connections.
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Result<Self, ConnectionError> {
        if connections.is_empty() {
            return Err(ConnectionError::NoConnections);
        }
        let errors = vec![0; connections.len()];
        Ok(Self {
            connections,
            state: Mutex::new(RoundRobinState { active: 0, errors }),
        })
    }

    /// Error counts per connection address, in configuration order.
    pub fn error_counts(&self) -> Vec<(String, u64)> {
        let state = self.state.lock();
        self.connections
            .iter()
            .zip(&state.errors)
            .map(|(connection, count)| (connection.address().to_string(), *count))
            .collect()
    }
}

impl ConnectionSource for RoundRobinSource {
    fn current(&self) -> Arc<dyn Connection> {
        let state = self.state.lock();
        Arc::clone(&self.connections[state.active])
    }

    fn report_error(&self, connection: &dyn Connection) {
        let mut state = self.state.lock();
        if let Some(index) = self
            .connections
            .iter()
            .position(|c| c.address() == connection.address())
        {
            state.errors[index] += 1;
            debug!(
                address = connection.address(),
                errors = state.errors[index],
                "connection reported failed"
            );
        }
    }

    fn rotate(&self) -> Arc<dyn Connection> {
        let mut state = self.state.lock();
        state.active = (state.active + 1) % self.connections.len();
        Arc::clone(&self.connections[state.active])
    }
}
