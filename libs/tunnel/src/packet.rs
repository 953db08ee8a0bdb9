use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Instant,
};

use socket_factory::{SocketFactory, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::{DohSlot, TunnelListener, UdpSummary};

const MAX_DATAGRAM: usize = 1500;

/// Engine-side sink for packets flowing back toward the guest.
#[async_trait::async_trait]
pub trait PacketResponder: Send + Sync + 'static {
    async fn receive_from(&self, payload: &[u8], src: SocketAddr) -> io::Result<()>;
}

/// Uplink half of one UDP association.
#[async_trait::async_trait]
pub trait PacketSender: Send + Sync + 'static {
    async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<()>;

    /// Idempotent; emits the association's summary on first call.
    async fn close(&self);
}

/// Capability port handed to the IP engine: called once per UDP
/// association accepted from the TUN side.
#[async_trait::async_trait]
pub trait PacketProxy: Send + Sync + 'static {
    async fn new_session(
        &self,
        responder: Arc<dyn PacketResponder>,
    ) -> io::Result<Arc<dyn PacketSender>>;
}

pub(crate) struct IntraPacketProxy {
    fake_dns: SocketAddr,
    doh: Arc<DohSlot>,
    udp_factory: Arc<dyn SocketFactory<UdpSocket>>,
    listener: Option<Arc<dyn TunnelListener>>,
}

impl IntraPacketProxy {
    pub(crate) fn new(
        fake_dns: SocketAddr,
        doh: Arc<DohSlot>,
        udp_factory: Arc<dyn SocketFactory<UdpSocket>>,
        listener: Option<Arc<dyn TunnelListener>>,
    ) -> Self {
        Self {
            fake_dns,
            doh,
            udp_factory,
            listener,
        }
    }
}

#[async_trait::async_trait]
impl PacketProxy for IntraPacketProxy {
    async fn new_session(
        &self,
        responder: Arc<dyn PacketResponder>,
    ) -> io::Result<Arc<dyn PacketSender>> {
        Ok(Arc::new(PacketSession {
            fake_dns: self.fake_dns,
            doh: self.doh.clone(),
            udp_factory: self.udp_factory.clone(),
            responder,
            meter: Arc::new(UdpMeter {
                upload: AtomicU64::new(0),
                download: AtomicU64::new(0),
                start: Instant::now(),
                server_port: AtomicU16::new(0),
                emitted: AtomicBool::new(false),
                listener: self.listener.clone(),
            }),
            relay: tokio::sync::Mutex::new(None),
            downlink: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct PacketSession {
    fake_dns: SocketAddr,
    doh: Arc<DohSlot>,
    udp_factory: Arc<dyn SocketFactory<UdpSocket>>,
    responder: Arc<dyn PacketResponder>,
    meter: Arc<UdpMeter>,

    /// The outbound socket, bound lazily on the first non-DNS packet.
    relay: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    downlink: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

struct UdpMeter {
    upload: AtomicU64,
    download: AtomicU64,
    start: Instant,
    server_port: AtomicU16,
    emitted: AtomicBool,
    listener: Option<Arc<dyn TunnelListener>>,
}

impl UdpMeter {
    fn emit(&self) {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(listener) = &self.listener else {
            return;
        };

        listener.on_udp_socket_closed(&UdpSummary {
            upload_bytes: self.upload.load(Ordering::Relaxed),
            download_bytes: self.download.load(Ordering::Relaxed),
            duration: self.start.elapsed(),
            server_port: self.server_port.load(Ordering::Relaxed),
        });
    }
}

impl PacketSession {
    async fn forward_dns(&self, query: &[u8]) -> io::Result<()> {
        self.meter
            .upload
            .fetch_add(query.len() as u64, Ordering::Relaxed);

        let transport = self.doh.load_full();
        let cancel = CancellationToken::new();

        let response = match transport.query(query, &cancel).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("DNS query failed: {e}");

                match e.response {
                    Some(response) => response,
                    None => match dns_wire::servfail(query) {
                        Some(response) => response,
                        None => return Ok(()), // Unanswerable; drop silently.
                    },
                }
            }
        };

        self.meter
            .download
            .fetch_add(response.len() as u64, Ordering::Relaxed);

        self.responder.receive_from(&response, self.fake_dns).await?;

        // An association that has only ever carried DNS is complete after
        // a single exchange.
        let dns_only = self.relay.lock().await.is_none();

        if dns_only {
            self.close().await;
        }

        Ok(())
    }

    async fn relay_socket(&self, dst: SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let mut slot = self.relay.lock().await;

        if let Some(socket) = &*slot {
            return Ok(socket.clone());
        }

        let socket = Arc::new(self.udp_factory.bind(socket_factory::unspecified_for(dst))?);

        self.meter.server_port.store(dst.port(), Ordering::Relaxed);

        let task = tokio::spawn({
            let socket = socket.clone();
            let responder = self.responder.clone();
            let meter = self.meter.clone();

            async move {
                let mut buf = [0u8; MAX_DATAGRAM];

                loop {
                    let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                        return;
                    };

                    meter.download.fetch_add(n as u64, Ordering::Relaxed);

                    if responder.receive_from(&buf[..n], from).await.is_err() {
                        return;
                    }
                }
            }
        });

        *self.downlink.lock() = Some(task);
        *slot = Some(socket.clone());

        Ok(socket)
    }
}

#[async_trait::async_trait]
impl PacketSender for PacketSession {
    async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::NotConnected.into());
        }

        if dst == self.fake_dns {
            return self.forward_dns(payload).await;
        }

        let socket = self.relay_socket(dst).await?;

        self.meter
            .upload
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        socket.send_to(payload, dst).await?;

        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self.downlink.lock().take() {
            task.abort();
        }

        *self.relay.lock().await = None;

        self.meter.emit();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arc_swap::ArcSwap;
    use doh::{QueryError, Transport};

    use super::*;

    struct StaticTransport(Vec<u8>);

    #[async_trait::async_trait]
    impl Transport for StaticTransport {
        async fn query(
            &self,
            _query: &[u8],
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>, QueryError> {
            Ok(self.0.clone())
        }

        fn url(&self) -> &str {
            "https://static.example/dns-query"
        }
    }

    struct ChannelResponder(tokio::sync::mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>);

    #[async_trait::async_trait]
    impl PacketResponder for ChannelResponder {
        async fn receive_from(&self, payload: &[u8], src: SocketAddr) -> io::Result<()> {
            self.0
                .send((payload.to_vec(), src))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        udp: parking_lot::Mutex<Vec<(u64, u64, u16)>>,
    }

    impl doh::QueryListener for RecordingListener {}

    impl TunnelListener for RecordingListener {
        fn on_udp_socket_closed(&self, summary: &UdpSummary) {
            self.udp.lock().push((
                summary.upload_bytes,
                summary.download_bytes,
                summary.server_port,
            ));
        }
    }

    fn fake_dns() -> SocketAddr {
        "10.111.222.3:53".parse().unwrap()
    }

    fn proxy_with(
        transport: Arc<dyn Transport>,
        listener: Arc<RecordingListener>,
    ) -> IntraPacketProxy {
        IntraPacketProxy::new(
            fake_dns(),
            Arc::new(ArcSwap::from_pointee(transport)),
            Arc::new(socket_factory::udp),
            Some(listener),
        )
    }

    #[tokio::test]
    async fn dns_only_association_closes_after_the_reply() {
        let listener = Arc::new(RecordingListener::default());
        let proxy = proxy_with(Arc::new(StaticTransport(b"reply".to_vec())), listener.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = proxy
            .new_session(Arc::new(ChannelResponder(tx)))
            .await
            .unwrap();

        session.send_to(b"query", fake_dns()).await.unwrap();

        let (payload, src) = rx.recv().await.unwrap();
        assert_eq!(payload, b"reply");
        assert_eq!(src, fake_dns());

        // The association closed itself and accounted the exchange.
        assert!(session.send_to(b"again", fake_dns()).await.is_err());

        let events = listener.udp.lock();
        assert_eq!(events.as_slice(), &[(5, 5, 0)]);
    }

    #[tokio::test]
    async fn plain_udp_is_relayed_both_ways() {
        let echo = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];

            loop {
                let Ok((n, from)) = echo.recv_from(&mut buf).await else {
                    return;
                };

                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let listener = Arc::new(RecordingListener::default());
        let proxy = proxy_with(Arc::new(StaticTransport(Vec::new())), listener.clone());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session = proxy
            .new_session(Arc::new(ChannelResponder(tx)))
            .await
            .unwrap();

        session.send_to(b"datagram", echo_addr).await.unwrap();

        let (payload, src) = rx.recv().await.unwrap();
        assert_eq!(payload, b"datagram");
        assert_eq!(src, echo_addr);

        session.close().await;
        session.close().await; // Idempotent.

        let events = listener.udp.lock();
        assert_eq!(events.as_slice(), &[(8, 8, echo_addr.port())]);
    }
}
