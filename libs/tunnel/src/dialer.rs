use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use socket_factory::{SocketFactory, TcpSocket};
use split_retry::RetryStats;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{DohSlot, TunnelListener, dot, stats::TcpStatsStream};

const HTTPS_PORT: u16 = 443;

/// Capacity of the in-memory pipe carrying DoT between engine and relay.
const DOT_PIPE_CAPACITY: usize = 64 * 1024;

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> DuplexStream for T {}

/// Capability port handed to the IP engine: called for every TCP flow the
/// engine accepts from the TUN side.
#[async_trait::async_trait]
pub trait StreamDialer: Send + Sync + 'static {
    async fn dial_stream(&self, dst: SocketAddr) -> io::Result<Box<dyn DuplexStream>>;
}

pub(crate) struct IntraStreamDialer {
    fake_dns: SocketAddr,
    doh: Arc<DohSlot>,
    tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
    listener: Option<Arc<dyn TunnelListener>>,
}

impl IntraStreamDialer {
    pub(crate) fn new(
        fake_dns: SocketAddr,
        doh: Arc<DohSlot>,
        tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
        listener: Option<Arc<dyn TunnelListener>>,
    ) -> Self {
        Self {
            fake_dns,
            doh,
            tcp_factory,
            listener,
        }
    }
}

#[async_trait::async_trait]
impl StreamDialer for IntraStreamDialer {
    async fn dial_stream(&self, dst: SocketAddr) -> io::Result<Box<dyn DuplexStream>> {
        // The guest believes fake-DNS is its resolver; TCP flows to it are
        // DNS-over-TCP and never leave the device.
        if dst == self.fake_dns {
            let (client, server) = tokio::io::duplex(DOT_PIPE_CAPACITY);

            tokio::spawn(dot::serve(server, self.doh.clone()));

            return Ok(Box::new(client));
        }

        let start = Instant::now();

        let (stream, retry): (Box<dyn DuplexStream>, Option<Arc<RetryStats>>) =
            if dst.port() == HTTPS_PORT {
                let stats = RetryStats::new();

                let stream = split_retry::dial_with_split_retry(
                    self.tcp_factory.clone(),
                    dst,
                    Some(stats.clone()),
                )
                .await?;

                (Box::new(stream), Some(stats))
            } else {
                let stream = self.tcp_factory.bind(dst)?.connect(dst).await?;

                (Box::new(stream), None)
            };

        let synack = start.elapsed();

        tracing::trace!(%dst, ?synack, "Dialed outbound TCP");

        Ok(Box::new(TcpStatsStream::new(
            stream,
            self.listener.clone(),
            dst.port(),
            synack,
            retry,
        )))
    }
}
