use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context as _, anyhow};
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use ip_map::IpMap;
use parking_lot::Mutex;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use socket_factory::{SocketFactory, TcpSocket};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::{QueryError, QueryListener, Status, Summary, Transport, hangover::Hangover};

const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_REDIRECTS: usize = 10;

const CONTENT_TYPE_DNS_MESSAGE: &str = "application/dns-message";
const USER_AGENT: &str = "Intra";

/// Client certificate material for servers that require mutual TLS.
pub struct ClientCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("DoH URL must use the https scheme")]
    UnsupportedScheme,
    #[error("DoH URL has no hostname")]
    MissingHostname,
    #[error("failed to parse DoH URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("no usable addresses for the DoH server")]
    NoAddresses,
    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// The concrete RFC 8484 POST transport.
///
/// Immutable after construction except for the confirmed slots inside its
/// [`IpMap`], the hangover deadline, and the observed hostname (which can
/// move when the server redirects us).
pub struct HttpsTransport {
    url: String,
    hostname: Mutex<String>,
    port: u16,
    path: String,

    ips: IpMap,
    tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
    tls_config: Arc<rustls::ClientConfig>,
    listener: Option<Arc<dyn QueryListener>>,
    hangover: Hangover,

    /// One pooled connection per `host:port`, checked out for the duration
    /// of an exchange.
    pool: tokio::sync::Mutex<HashMap<String, PooledConn>>,
}

impl HttpsTransport {
    /// Builds a transport for the given DoH URL.
    ///
    /// The URL's hostname is resolved through `resolver`; `fallback`
    /// entries (addresses or hostnames) are added to the pool afterwards.
    /// Construction fails if no address at all is known by then.
    pub async fn new(
        url: &str,
        fallback: &[String],
        tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
        resolver: Arc<dyn ip_map::Resolver>,
        client_cert: Option<ClientCert>,
        listener: Option<Arc<dyn QueryListener>>,
    ) -> Result<Self, TransportError> {
        Self::with_extra_roots(
            url,
            fallback,
            tcp_factory,
            resolver,
            client_cert,
            listener,
            Vec::new(),
        )
        .await
    }

    /// Like [`HttpsTransport::new`] with additional trust anchors, for
    /// private deployments and tests.
    pub async fn with_extra_roots(
        url: &str,
        fallback: &[String],
        tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
        resolver: Arc<dyn ip_map::Resolver>,
        client_cert: Option<ClientCert>,
        listener: Option<Arc<dyn QueryListener>>,
        extra_roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TransportError> {
        let parsed = url::Url::parse(url)?;

        if parsed.scheme() != "https" {
            return Err(TransportError::UnsupportedScheme);
        }

        // `host_str` keeps IPv6 brackets; TLS server names and the IP map
        // want the bare form.
        let hostname = match parsed.host() {
            Some(url::Host::Domain(domain)) => domain.to_owned(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(TransportError::MissingHostname),
        };
        let port = parsed.port().unwrap_or(443);
        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_owned(),
        };

        let ips = IpMap::new(resolver);

        let endpoint = ips.get(&hostname).await;

        for entry in fallback {
            endpoint.add(entry).await;
        }

        if endpoint.is_empty() {
            return Err(TransportError::NoAddresses);
        }

        let tls_config = build_tls_config(client_cert, extra_roots)?;

        Ok(Self {
            url: url.to_owned(),
            hostname: Mutex::new(hostname),
            port,
            path,
            ips,
            tcp_factory,
            tls_config: Arc::new(tls_config),
            listener,
            hangover: Hangover::new(),
            pool: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The address of the server that last completed a query, if any.
    pub async fn confirmed(&self) -> Option<IpAddr> {
        let hostname = self.hostname.lock().clone();

        self.ips.get(&hostname).await.confirmed()
    }

    async fn query_inner(&self, query: &[u8]) -> Result<QueryOk, QueryError> {
        let Some(id) = dns_wire::query_id(query) else {
            return Err(QueryError::new(
                Status::BadQuery,
                anyhow!("query of {} bytes is too short", query.len()),
            ));
        };

        if let Some(remaining) = self.hangover.remaining() {
            let mut e = QueryError::new(
                Status::HttpError,
                anyhow!("forwarder in servfail hangover for another {remaining:?}"),
            );
            e.response = dns_wire::servfail(query);
            e.from_hangover = true;

            return Err(e);
        }

        let mut padded = dns_wire::add_edns_padding(query.to_vec()).map_err(|e| {
            QueryError::new(
                Status::InternalError,
                anyhow::Error::new(e).context("failed to pad query"),
            )
        })?;

        // Zeroing the ID makes queries cache- and privacy-friendlier; the
        // original is restored into the response below.
        dns_wire::set_query_id(&mut padded, 0);

        let exchange = self.roundtrip(Bytes::from(padded)).await?;

        // Redirects may have moved us; later queries go there directly.
        *self.hostname.lock() = exchange.host.clone();

        if exchange.status != 200 {
            return Err(QueryError::new(
                Status::HttpError,
                anyhow!("HTTP status {}", exchange.status),
            )
            .with_http_status(exchange.status)
            .with_server(exchange.server));
        }

        let mut response = exchange.body.to_vec();

        match dns_wire::query_id(&response) {
            Some(0) => dns_wire::set_query_id(&mut response, id),
            Some(other) => {
                return Err(QueryError::new(
                    Status::BadResponse,
                    anyhow!("response ID must be zero, got {other:#06x}"),
                )
                .with_server(exchange.server));
            }
            None => {
                return Err(QueryError::new(
                    Status::BadResponse,
                    anyhow!("response of {} bytes is too short", response.len()),
                )
                .with_server(exchange.server));
            }
        }

        // Remember the address that worked, keyed by the final hostname.
        self.ips.get(&exchange.host).await.confirm(exchange.server);

        Ok(QueryOk {
            response,
            server: exchange.server,
            http_status: exchange.status,
        })
    }

    async fn roundtrip(&self, body: Bytes) -> Result<HttpExchange, QueryError> {
        let mut host = self.hostname.lock().clone();
        let mut port = self.port;
        let mut path = self.path.clone();

        for _ in 0..MAX_REDIRECTS {
            let (parts, bytes, server) = self
                .exchange_once(&host, port, &path, body.clone())
                .await?;

            if parts.status.is_redirection()
                && let Some(location) = parts.headers.get(http::header::LOCATION)
                && let Some(target) = redirect_target(&host, port, &path, location)
            {
                tracing::debug!(from = %host, to = %target.0, "Following redirect");

                (host, port, path) = target;

                continue;
            }

            return Ok(HttpExchange {
                status: parts.status.as_u16(),
                body: bytes,
                server,
                host,
            });
        }

        Err(QueryError::new(
            Status::SendFailed,
            anyhow!("stopped after {MAX_REDIRECTS} redirects"),
        ))
    }

    async fn exchange_once(
        &self,
        host: &str,
        port: u16,
        path: &str,
        body: Bytes,
    ) -> Result<(http::response::Parts, Bytes, IpAddr), QueryError> {
        let mut conn = self
            .checkout(host, port)
            .await
            .map_err(|e| QueryError::new(Status::SendFailed, e))?;

        let server = conn.remote;

        let request = build_request(conn.sender.is_h2(), host, port, path, body)
            .map_err(|e| QueryError::new(Status::InternalError, e).with_server(server))?;

        let send = async {
            conn.sender.ready().await.context("connection not ready")?;

            let response = tokio::time::timeout(
                RESPONSE_HEADER_TIMEOUT,
                conn.sender.send_request(request),
            )
            .await
            .map_err(|_| anyhow!("timed out waiting for response headers"))?
            .context("failed to send request")?;

            Ok::<_, anyhow::Error>(response)
        };

        let response = match send.await {
            Ok(response) => response,
            Err(e) => {
                // These sockets frequently go dead across network changes;
                // drop the connection instead of returning it and stop
                // preferring its address.
                self.ips.get(host).await.disconfirm(server);

                return Err(QueryError::new(Status::SendFailed, e).with_server(server));
            }
        };

        let (parts, incoming) = response.into_parts();

        let bytes = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return Err(QueryError::new(
                    Status::BadResponse,
                    anyhow::Error::new(e).context("failed to read response body"),
                )
                .with_server(server));
            }
        };

        // The connection survived a full exchange; give it back.
        self.pool.lock().await.insert(pool_key(host, port), conn);

        Ok((parts, bytes, server))
    }

    async fn checkout(&self, host: &str, port: u16) -> anyhow::Result<PooledConn> {
        if let Some(conn) = self.pool.lock().await.remove(&pool_key(host, port))
            && !conn.sender.is_closed()
        {
            return Ok(conn);
        }

        self.connect_to_host(host, port).await
    }

    /// Dials the host: the confirmed address first, then every other known
    /// address in insertion order.
    async fn connect_to_host(&self, host: &str, port: u16) -> anyhow::Result<PooledConn> {
        let endpoint = self.ips.get(host).await;

        let confirmed = endpoint.confirmed();

        if let Some(addr) = confirmed {
            match self.connect_to_addr(addr, host, port).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(%addr, %host, "Confirmed address failed: {e:#}");

                    endpoint.disconfirm(addr);
                }
            }
        }

        let mut last_error = None;

        for addr in endpoint.get_all() {
            if Some(addr) == confirmed {
                continue; // Already tried above.
            }

            match self.connect_to_addr(addr, host, port).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(%addr, %host, "Failed to connect: {e:#}");

                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no addresses for '{host}'")))
    }

    async fn connect_to_addr(
        &self,
        addr: IpAddr,
        host: &str,
        port: u16,
    ) -> anyhow::Result<PooledConn> {
        let socket = SocketAddr::new(addr, port);

        let stream = tokio::time::timeout(
            TCP_DIAL_TIMEOUT,
            split_retry::dial_with_split_retry(self.tcp_factory.clone(), socket, None),
        )
        .await
        .context("TCP dial timed out")?
        .context("TCP dial failed")?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let domain = ServerName::try_from(host.to_owned()).context("invalid TLS server name")?;

        let stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, connector.connect(domain, stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        let is_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());

        let sender = if is_h2 {
            let (sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
                .timer(TokioTimer::default())
                .handshake(TokioIo::new(stream))
                .await
                .context("HTTP/2 handshake failed")?;

            spawn_driver(host, conn);

            HttpSender::H2(sender)
        } else {
            let (sender, conn) = hyper::client::conn::http1::Builder::new()
                .handshake(TokioIo::new(stream))
                .await
                .context("HTTP/1.1 handshake failed")?;

            spawn_driver(host, conn);

            HttpSender::H1(sender)
        };

        tracing::debug!(%socket, %host, h2 = %is_h2, "Created new DoH connection");

        Ok(PooledConn {
            sender,
            remote: addr,
        })
    }
}

#[async_trait::async_trait]
impl Transport for HttpsTransport {
    async fn query(
        &self,
        query: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, QueryError> {
        let token = self.listener.as_ref().and_then(|l| l.on_query(&self.url));

        let start = Instant::now();

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(QueryError::cancelled()),
            result = self.query_inner(query) => result,
        };

        if let Err(e) = &result {
            let opens_hangover = !e.from_hangover
                && !e.is_cancelled()
                && matches!(
                    e.status,
                    Status::HttpError | Status::BadResponse | Status::InternalError
                );

            if opens_hangover {
                tracing::debug!(url = %self.url, "Entering servfail hangover: {e:#}");

                self.hangover.open();
            }
        }

        let cancelled = result.as_ref().is_err_and(QueryError::is_cancelled);

        if let Some(listener) = &self.listener
            && !cancelled
        {
            let summary = match &result {
                Ok(ok) => Summary {
                    latency: start.elapsed(),
                    query: query.to_vec(),
                    response: ok.response.clone(),
                    server: Some(ok.server),
                    status: Status::Complete,
                    http_status: ok.http_status,
                },
                Err(e) => Summary {
                    latency: start.elapsed(),
                    query: query.to_vec(),
                    response: e.response.clone().unwrap_or_default(),
                    server: e.server,
                    status: e.status,
                    http_status: e.http_status,
                },
            };

            listener.on_response(token, &summary);
        }

        result.map(|ok| ok.response)
    }

    fn url(&self) -> &str {
        &self.url
    }
}

struct QueryOk {
    response: Vec<u8>,
    server: IpAddr,
    http_status: u16,
}

struct HttpExchange {
    status: u16,
    body: Bytes,
    server: IpAddr,
    host: String,
}

struct PooledConn {
    sender: HttpSender,
    remote: IpAddr,
}

enum HttpSender {
    H1(hyper::client::conn::http1::SendRequest<Full<Bytes>>),
    H2(hyper::client::conn::http2::SendRequest<Full<Bytes>>),
}

impl HttpSender {
    fn is_h2(&self) -> bool {
        matches!(self, HttpSender::H2(_))
    }

    fn is_closed(&self) -> bool {
        match self {
            HttpSender::H1(sender) => sender.is_closed(),
            HttpSender::H2(sender) => sender.is_closed(),
        }
    }

    async fn ready(&mut self) -> hyper::Result<()> {
        match self {
            HttpSender::H1(sender) => sender.ready().await,
            HttpSender::H2(sender) => sender.ready().await,
        }
    }

    async fn send_request(
        &mut self,
        request: http::Request<Full<Bytes>>,
    ) -> hyper::Result<http::Response<Incoming>> {
        match self {
            HttpSender::H1(sender) => sender.send_request(request).await,
            HttpSender::H2(sender) => sender.send_request(request).await,
        }
    }
}

fn spawn_driver<T>(host: &str, conn: T)
where
    T: Future<Output = hyper::Result<()>> + Send + 'static,
{
    let host = host.to_owned();

    tokio::spawn(async move {
        match conn.await {
            Ok(()) => tracing::debug!(%host, "DoH connection finished"),
            Err(e) => tracing::debug!(%host, "DoH connection failed: {e}"),
        }
    });
}

fn build_tls_config(
    client_cert: Option<ClientCert>,
    extra_roots: Vec<CertificateDer<'static>>,
) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for cert in extra_roots {
        roots.add(cert)?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots);

    let mut config = match client_cert {
        Some(ClientCert { chain, key }) => builder.with_client_auth_cert(chain, key)?,
        None => builder.with_no_client_auth(),
    };

    // HTTP/2 preferred; the server's ALPN choice picks the hyper flavor.
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

/// Re-adds the brackets an IPv6 authority needs on the wire.
fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}

fn build_request(
    is_h2: bool,
    host: &str,
    port: u16,
    path: &str,
    body: Bytes,
) -> Result<http::Request<Full<Bytes>>, http::Error> {
    let host = bracketed(host);

    let authority = if port == 443 {
        host
    } else {
        format!("{host}:{port}")
    };

    // HTTP/2 derives :scheme/:authority from an absolute URI; HTTP/1.1
    // wants an origin-form target plus a Host header.
    let builder = if is_h2 {
        http::Request::post(format!("https://{authority}{path}"))
    } else {
        http::Request::post(path).header(http::header::HOST, authority)
    };

    builder
        .header(http::header::CONTENT_TYPE, CONTENT_TYPE_DNS_MESSAGE)
        .header(http::header::ACCEPT, CONTENT_TYPE_DNS_MESSAGE)
        .header(http::header::USER_AGENT, USER_AGENT)
        .body(Full::new(body))
}

fn redirect_target(
    host: &str,
    port: u16,
    path: &str,
    location: &http::HeaderValue,
) -> Option<(String, u16, String)> {
    let location = location.to_str().ok()?;

    let base = url::Url::parse(&format!("https://{}:{port}{path}", bracketed(host))).ok()?;
    let target = base.join(location).ok()?;

    if target.scheme() != "https" {
        return None;
    }

    let host = match target.host()? {
        url::Host::Domain(domain) => domain.to_owned(),
        url::Host::Ipv4(ip) => ip.to_string(),
        url::Host::Ipv6(ip) => ip.to_string(),
    };
    let port = target.port().unwrap_or(443);
    let path = match target.query() {
        Some(query) => format!("{}?{}", target.path(), query),
        None => target.path().to_owned(),
    };

    Some((host, port, path))
}

fn pool_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn redirect_target_resolves_relative_locations() {
        let location = http::HeaderValue::from_static("/other-path");

        let (host, port, path) =
            redirect_target("dns.example", 443, "/dns-query", &location).unwrap();

        assert_eq!(host, "dns.example");
        assert_eq!(port, 443);
        assert_eq!(path, "/other-path");
    }

    #[test]
    fn redirect_target_follows_absolute_https_urls() {
        let location = http::HeaderValue::from_static("https://other.example:8443/dns");

        let (host, port, path) =
            redirect_target("dns.example", 443, "/dns-query", &location).unwrap();

        assert_eq!(host, "other.example");
        assert_eq!(port, 8443);
        assert_eq!(path, "/dns");
    }

    #[test]
    fn redirect_target_refuses_plain_http() {
        let location = http::HeaderValue::from_static("http://other.example/dns");

        assert!(redirect_target("dns.example", 443, "/dns-query", &location).is_none());
    }

    #[test]
    fn h1_requests_use_origin_form_with_host_header() {
        let request = build_request(false, "dns.example", 8443, "/dns-query", Bytes::new()).unwrap();

        assert_eq!(request.uri().to_string(), "/dns-query");
        assert_eq!(
            request.headers().get(http::header::HOST).unwrap(),
            "dns.example:8443"
        );
    }

    #[test]
    fn h2_requests_use_absolute_uris() {
        let request = build_request(true, "dns.example", 443, "/dns-query", Bytes::new()).unwrap();

        assert_eq!(request.uri().to_string(), "https://dns.example/dns-query");
        assert_eq!(
            request.headers().get(http::header::USER_AGENT).unwrap(),
            "Intra"
        );
    }
}
