//! TCP dialing with transparent first-flight replay.
//!
//! Some networks tear down connections based on the TLS SNI of the first
//! client flight. [`dial_with_split_retry`] buffers that flight and, when
//! the connection dies or stalls before the first reply, re-dials and
//! replays the flight split across several packets so that the server name
//! does not appear in a single segment on the wire.

mod sni;
mod split;

pub use split::{MAX_SPLIT, MIN_SPLIT, split_hello};

use std::{
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use socket_factory::{SocketFactory, TcpSocket, TcpStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, ReadBuf};

/// Base of the provisional read deadline; the handshake RTT is added twice.
const RETRY_BASE_TIMEOUT: Duration = Duration::from_millis(1200);

/// Per-connection observations of the retry machinery.
///
/// All fields are monotonic: they are only ever written before the retry
/// completes and the SNI, once extracted, never changes.
#[derive(Default, Debug)]
pub struct RetryStats {
    sni: Mutex<Option<String>>,
    upload_bytes: AtomicU64,
    chunks: AtomicU32,
    split: AtomicU32,
    timeout: AtomicBool,
}

impl RetryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The TLS server name observed in the first flight, if any.
    pub fn sni(&self) -> Option<String> {
        self.sni.lock().clone()
    }

    /// Bytes uploaded before the retry completed.
    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    /// Number of write calls before the retry completed.
    pub fn chunks(&self) -> u32 {
        self.chunks.load(Ordering::Relaxed)
    }

    /// Size of the first retried segment; zero if no retry happened.
    pub fn split(&self) -> u16 {
        self.split.load(Ordering::Relaxed) as u16
    }

    /// Whether the retry was triggered by the read deadline.
    pub fn timeout(&self) -> bool {
        self.timeout.load(Ordering::Relaxed)
    }

    fn record_chunk(&self, len: usize) {
        self.upload_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn observe_hello(&self, hello: &[u8]) {
        let mut sni = self.sni.lock();

        if sni.is_some() {
            return; // The first extracted name sticks.
        }

        *sni = sni::extract_sni(hello);
    }
}

/// Opens a TCP connection to `dest` whose first flight is replayed, split,
/// on a fresh connection if no reply arrives.
///
/// The connection is intended for one reader and one writer task, exactly
/// like a plain TCP socket; split it with [`tokio::io::split`] or drive it
/// from a single task.
pub async fn dial_with_split_retry(
    factory: Arc<dyn SocketFactory<TcpSocket>>,
    dest: SocketAddr,
    stats: Option<Arc<RetryStats>>,
) -> io::Result<SplitRetryStream> {
    // A throwaway record when the caller doesn't want stats, so the write
    // path never branches on it.
    let stats = stats.unwrap_or_default();

    let before = tokio::time::Instant::now();
    let stream = factory.bind(dest)?.connect(dest).await?;
    let rtt = before.elapsed();

    tracing::trace!(%dest, ?rtt, "Connected");

    Ok(SplitRetryStream {
        factory,
        dest,
        stats,
        stream: Some(stream),
        hello: Vec::new(),
        retry_timeout: RETRY_BASE_TIMEOUT + 2 * rtt,
        deadline: None,
        retry_done: false,
        retrying: None,
        read_waker: None,
        write_waker: None,
        write_parked: false,
        fault: None,
        write_shutdown: false,
        read_shutdown: false,
    })
}

pub struct SplitRetryStream {
    factory: Arc<dyn SocketFactory<TcpSocket>>,
    dest: SocketAddr,
    stats: Arc<RetryStats>,

    /// The current socket; empty while a retry dial is in flight or after
    /// a failed retry.
    stream: Option<TcpStream>,
    /// The buffered first flight; non-empty only before the retry completes.
    hello: Vec<u8>,

    retry_timeout: Duration,
    /// Read deadline on the provisional socket, re-armed on every write.
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,

    /// Once set, the hello is gone and no further retry is possible.
    retry_done: bool,
    retrying: Option<BoxFuture<'static, io::Result<TcpStream>>>,

    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    /// The provisional write failed; the writer waits for the reader to
    /// finish the retry.
    write_parked: bool,
    /// A failed retry poisons the connection with this error kind.
    fault: Option<io::ErrorKind>,

    write_shutdown: bool,
    read_shutdown: bool,
}

impl SplitRetryStream {
    /// The address of the current socket.
    ///
    /// May change after a retry; callers must not rely on it being stable.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.dest)
    }

    pub fn stats(&self) -> Arc<RetryStats> {
        self.stats.clone()
    }

    /// Stops the read half. Idempotent; a retry in flight re-applies the
    /// intent to the swapped socket.
    pub fn close_read(&mut self) {
        self.read_shutdown = true;

        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn start_retry(&mut self, timed_out: bool) {
        debug_assert!(!self.retry_done);

        if timed_out {
            self.stats.timeout.store(true, Ordering::Relaxed);
        }

        tracing::debug!(dest = %self.dest, %timed_out, hello = self.hello.len(), "Retrying first flight");

        drop(self.stream.take());

        let factory = self.factory.clone();
        let dest = self.dest;
        let hello = self.hello.clone();
        let stats = self.stats.clone();
        let write_shutdown = self.write_shutdown;
        let read_shutdown = self.read_shutdown;

        self.retrying = Some(Box::pin(async move {
            let mut stream = factory.bind(dest)?.connect(dest).await?;

            let (segments, split) = split_hello(&hello, &mut rand::thread_rng());
            stats.split.store(split as u32, Ordering::Relaxed);

            // One write per segment; a gathered write would let the kernel
            // coalesce the segments back into a single packet.
            for segment in &segments {
                if segment.is_empty() {
                    continue;
                }

                stream.write_all(segment).await?;
            }

            if write_shutdown {
                stream.shutdown().await?;
            }

            #[cfg(unix)]
            if read_shutdown {
                stream.shutdown_read();
            }
            #[cfg(not(unix))]
            let _ = read_shutdown;

            Ok(stream)
        }));
    }

    fn complete_retry(&mut self, fault: Option<io::ErrorKind>) {
        self.retry_done = true;
        self.hello = Vec::new();
        self.deadline = None;
        self.fault = fault;
        self.write_parked = false;

        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }
}

impl AsyncRead for SplitRetryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.read_shutdown {
                return Poll::Ready(Ok(()));
            }

            if let Some(retrying) = this.retrying.as_mut() {
                match retrying.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(stream)) => {
                        this.stream = Some(stream);
                        this.retrying = None;
                        this.complete_retry(None);

                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        tracing::debug!(dest = %this.dest, "Retry failed: {e}");

                        this.retrying = None;
                        this.complete_retry(Some(e.kind()));

                        return Poll::Ready(Err(e));
                    }
                }
            }

            let Some(stream) = this.stream.as_mut() else {
                let kind = this.fault.unwrap_or(io::ErrorKind::NotConnected);

                return Poll::Ready(Err(kind.into()));
            };

            let before = buf.filled().len();

            match Pin::new(stream).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len() - before;

                    if n > 0 {
                        if !this.retry_done {
                            // The server answered; the first flight got through.
                            this.complete_retry(None);
                        }

                        return Poll::Ready(Ok(()));
                    }

                    if this.retry_done {
                        return Poll::Ready(Ok(())); // Regular EOF.
                    }

                    // EOF before the first reply: middlebox teardown.
                    this.start_retry(false);
                }
                Poll::Ready(Err(e)) => {
                    if this.retry_done {
                        return Poll::Ready(Err(e));
                    }

                    tracing::debug!(dest = %this.dest, "Read failed before first reply: {e}");

                    this.start_retry(false);
                }
                Poll::Pending => {
                    if !this.retry_done
                        && let Some(deadline) = this.deadline.as_mut()
                        && deadline.as_mut().poll(cx).is_ready()
                    {
                        this.start_retry(true);

                        continue;
                    }

                    this.read_waker = Some(cx.waker().clone());

                    return Poll::Pending;
                }
            }
        }
    }
}

impl AsyncWrite for SplitRetryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_shutdown {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }

        if this.retry_done {
            if let Some(kind) = this.fault {
                return Poll::Ready(Err(kind.into()));
            }

            let Some(stream) = this.stream.as_mut() else {
                return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
            };

            return Pin::new(stream).poll_write(cx, buf);
        }

        if this.write_parked {
            // Retry pending; the reader drives it and wakes us.
            this.write_waker = Some(cx.waker().clone());

            return Poll::Pending;
        }

        let Some(stream) = this.stream.as_mut() else {
            this.write_waker = Some(cx.waker().clone());

            return Poll::Pending;
        };

        match Pin::new(stream).poll_write(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(n)) => {
                this.hello.extend_from_slice(&buf[..n]);
                this.stats.record_chunk(n);
                this.stats.observe_hello(&this.hello);

                // Give the server the retry timeout to produce its first
                // byte, counted from the latest write.
                this.deadline = Some(Box::pin(tokio::time::sleep(this.retry_timeout)));

                if let Some(waker) = this.read_waker.take() {
                    // The parked reader must re-register with the new deadline.
                    waker.wake();
                }

                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(e)) => {
                tracing::debug!(dest = %this.dest, "Provisional write failed, deferring to retry: {e}");

                this.write_parked = true;
                this.write_waker = Some(cx.waker().clone());

                if let Some(waker) = this.read_waker.take() {
                    waker.wake();
                }

                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        this.write_shutdown = true;

        match this.stream.as_mut() {
            // A retry in flight re-applies the intent to the swapped socket.
            None => Poll::Ready(Ok(())),
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sni_sticks_once_extracted() {
        let stats = RetryStats::default();
        let hello = sni::tests::client_hello_with_sni("first.example");

        stats.observe_hello(&hello[..10]);
        assert_eq!(stats.sni(), None);

        stats.observe_hello(&hello);
        assert_eq!(stats.sni().as_deref(), Some("first.example"));

        stats.observe_hello(&sni::tests::client_hello_with_sni("second.example"));
        assert_eq!(stats.sni().as_deref(), Some("first.example"));
    }
}
