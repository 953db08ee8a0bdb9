use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use split_retry::RetryStats;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{TunnelListener, dialer::DuplexStream};

/// Final accounting of one relayed TCP flow.
#[derive(Debug)]
pub struct TcpSummary {
    /// Bytes sent from the guest to the server.
    pub upload_bytes: u64,
    /// Bytes sent from the server to the guest.
    pub download_bytes: u64,
    pub duration: Duration,
    pub server_port: u16,
    /// TCP handshake time in milliseconds.
    pub synack_ms: u32,
    /// Present on flows that went through the split-retry dialer.
    pub retry: Option<Arc<RetryStats>>,
}

/// Final accounting of one UDP association.
#[derive(Debug)]
pub struct UdpSummary {
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub duration: Duration,
    pub server_port: u16,
}

/// Wraps a relayed stream, counts bytes in both directions and emits a
/// [`TcpSummary`] exactly once when the flow ends.
pub(crate) struct TcpStatsStream {
    inner: Box<dyn DuplexStream>,
    meter: Meter,
}

struct Meter {
    upload: AtomicU64,
    download: AtomicU64,
    start: Instant,
    server_port: u16,
    synack_ms: u32,
    retry: Option<Arc<RetryStats>>,
    listener: Option<Arc<dyn TunnelListener>>,
    emitted: AtomicBool,
}

impl TcpStatsStream {
    pub(crate) fn new(
        inner: Box<dyn DuplexStream>,
        listener: Option<Arc<dyn TunnelListener>>,
        server_port: u16,
        synack: Duration,
        retry: Option<Arc<RetryStats>>,
    ) -> Self {
        Self {
            inner,
            meter: Meter {
                upload: AtomicU64::new(0),
                download: AtomicU64::new(0),
                start: Instant::now(),
                server_port,
                synack_ms: synack.as_millis().try_into().unwrap_or(u32::MAX),
                retry,
                listener: listener.clone(),
                emitted: AtomicBool::new(false),
            },
        }
    }
}

impl Meter {
    /// Emits the summary; the first caller wins, everybody else is a no-op.
    fn emit(&self) {
        if self.emitted.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(listener) = &self.listener else {
            return;
        };

        listener.on_tcp_socket_closed(&TcpSummary {
            upload_bytes: self.upload.load(Ordering::Relaxed),
            download_bytes: self.download.load(Ordering::Relaxed),
            duration: self.start.elapsed(),
            server_port: self.server_port,
            synack_ms: self.synack_ms,
            retry: self.retry.clone(),
        });
    }
}

impl Drop for TcpStatsStream {
    fn drop(&mut self) {
        self.meter.emit();
    }
}

impl AsyncRead for TcpStatsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let before = buf.filled().len();

        let result = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = &result {
            let n = buf.filled().len() - before;
            this.meter.download.fetch_add(n as u64, Ordering::Relaxed);
        }

        result
    }
}

impl AsyncWrite for TcpStatsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let result = Pin::new(&mut this.inner).poll_write(cx, buf);

        if let Poll::Ready(Ok(n)) = &result {
            this.meter.upload.fetch_add(*n as u64, Ordering::Relaxed);
        }

        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);

        if let Poll::Ready(Ok(n)) = &result {
            this.meter.upload.fetch_add(*n as u64, Ordering::Relaxed);
        }

        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        tcp: Mutex<Vec<(u64, u64, u16)>>,
    }

    impl doh::QueryListener for RecordingListener {}

    impl TunnelListener for RecordingListener {
        fn on_tcp_socket_closed(&self, summary: &TcpSummary) {
            self.tcp.lock().push((
                summary.upload_bytes,
                summary.download_bytes,
                summary.server_port,
            ));
        }
    }

    #[tokio::test]
    async fn counts_bytes_and_emits_once_on_drop() {
        let listener = Arc::new(RecordingListener::default());

        let (near, far) = tokio::io::duplex(1024);

        let mut stream = TcpStatsStream::new(
            Box::new(near),
            Some(listener.clone()),
            443,
            Duration::from_millis(12),
            None,
        );

        let peer = tokio::spawn(async move {
            let mut far = far;

            let mut buf = [0u8; 7];
            far.read_exact(&mut buf).await.unwrap();
            far.write_all(b"pong").await.unwrap();
        });

        stream.write_all(b"payload").await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();

        peer.await.unwrap();

        stream.meter.emit();
        drop(stream); // The drop emit must be a no-op now.

        let events = listener.tcp.lock();
        assert_eq!(events.as_slice(), &[(7, 4, 443)]);
    }
}
