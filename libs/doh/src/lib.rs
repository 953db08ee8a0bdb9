//! DNS-over-HTTPS client, POST variant of RFC 8484.
//!
//! Queries are hardened before they go on the wire: the message is padded
//! to a fixed block size and its ID is zeroed (both make queries less
//! distinguishable), and a server that misbehaves is put in a short
//! "hangover" during which we answer SERVFAIL locally instead of hammering
//! it.

mod hangover;
mod transport;

pub use transport::{ClientCert, HttpsTransport, TransportError};

use std::{any::Any, net::IpAddr, time::Duration};

use tokio_util::sync::CancellationToken;

/// Outcome classification of a single DoH query.
///
/// The discriminants are stable; they are surfaced to the host as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Complete = 0,
    SendFailed = 1,
    HttpError = 2,
    BadQuery = 3,
    BadResponse = 4,
    InternalError = 5,
}

impl Status {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Opaque value returned by [`QueryListener::on_query`], handed back
/// verbatim to the matching [`QueryListener::on_response`].
pub type Token = Option<Box<dyn Any + Send>>;

/// Per-query observer.
///
/// For every `on_query` there is at most one `on_response`, and none at all
/// when the query terminated because its [`CancellationToken`] fired: the
/// host's stop path may hold the very lock the callback would take.
pub trait QueryListener: Send + Sync + 'static {
    fn on_query(&self, url: &str) -> Token {
        None
    }

    fn on_response(&self, token: Token, summary: &Summary) {
        let _ = (token, summary);
    }
}

/// What happened to one accepted query.
#[derive(Debug)]
pub struct Summary {
    pub latency: Duration,
    pub query: Vec<u8>,
    pub response: Vec<u8>,
    /// The address of the server that answered, if a connection was reached.
    pub server: Option<IpAddr>,
    pub status: Status,
    /// Zero unless `status` is [`Status::Complete`] or [`Status::HttpError`].
    pub http_status: u16,
}

/// A DNS transport. Implemented by [`HttpsTransport`]; stubbed in tests.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolves a single raw DNS query.
    ///
    /// Dropping the future or cancelling `cancel` aborts the HTTP exchange.
    async fn query(&self, query: &[u8], cancel: &CancellationToken)
    -> Result<Vec<u8>, QueryError>;

    /// The DoH URL this transport talks to.
    fn url(&self) -> &str;

    /// Health check: sends a fixed A query and succeeds iff an answer came back.
    async fn probe(&self) -> Result<(), QueryError> {
        let response = self
            .query(&dns_wire::probe_query(), &CancellationToken::new())
            .await?;

        if response.is_empty() {
            return Err(QueryError::new(
                Status::BadResponse,
                anyhow::anyhow!("probe returned an empty response"),
            ));
        }

        Ok(())
    }
}

/// Marker placed in the cause chain of queries that were cancelled.
#[derive(Debug, thiserror::Error)]
#[error("query was cancelled")]
pub struct Cancelled;

#[derive(Debug, thiserror::Error)]
#[error("{status:?} (http {http_status}): {source:#}")]
pub struct QueryError {
    pub status: Status,
    /// Zero unless `status` is [`Status::HttpError`] with a real response.
    pub http_status: u16,
    /// A locally synthesized reply (SERVFAIL) the guest can still be given.
    pub response: Option<Vec<u8>>,
    /// The server we had reached when the query failed, if any.
    pub server: Option<IpAddr>,
    #[source]
    source: anyhow::Error,

    /// Failures triggered by an active hangover must not extend it.
    pub(crate) from_hangover: bool,
}

impl QueryError {
    /// Also the constructor for [`Transport`] implementations outside this crate.
    pub fn new(status: Status, source: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            http_status: 0,
            response: None,
            server: None,
            source: source.into(),
            from_hangover: false,
        }
    }

    pub(crate) fn with_http_status(mut self, http_status: u16) -> Self {
        self.http_status = http_status;
        self
    }

    pub(crate) fn with_server(mut self, server: IpAddr) -> Self {
        self.server = Some(server);
        self
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(Status::SendFailed, Cancelled)
    }

    /// Whether the query terminated because its context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.source.chain().any(|c| c.is::<Cancelled>())
    }
}
