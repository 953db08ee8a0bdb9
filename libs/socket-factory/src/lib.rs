mod resolver;

pub use resolver::SystemResolver;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[cfg(unix)]
use std::os::fd::RawFd;

pub trait SocketFactory<S>: Send + Sync + 'static {
    fn bind(&self, local: SocketAddr) -> io::Result<S>;
    fn reset(&self);
}

impl<F, S> SocketFactory<S> for F
where
    F: Fn(SocketAddr) -> io::Result<S> + Send + Sync + 'static,
{
    fn bind(&self, local: SocketAddr) -> io::Result<S> {
        (self)(local)
    }

    fn reset(&self) {}
}

/// Host-provided hook that excludes individual sockets from the VPN.
///
/// On modern platforms `protect` is a no-op because the VPN already
/// excludes the app by identity; the hook remains for the platforms where
/// it isn't.
pub trait Protector: Send + Sync + 'static {
    /// Marks the file descriptor to bypass the VPN. Returns `false` on failure.
    #[cfg(unix)]
    fn protect(&self, fd: RawFd) -> bool;

    /// The host's nameservers as a comma-separated list of IPs.
    fn resolvers(&self) -> String;
}

pub fn tcp(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };

    socket.set_nodelay(true)?;

    Ok(TcpSocket { inner: socket })
}

pub fn udp(std_addr: SocketAddr) -> io::Result<UdpSocket> {
    let addr = socket2::SockAddr::from(std_addr);
    let socket = socket2::Socket::new(addr.domain(), socket2::Type::DGRAM, None)?;

    // Note: for AF_INET sockets IPV6_V6ONLY is not a valid flag
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr)?;

    let socket = std::net::UdpSocket::from(socket);
    let socket = tokio::net::UdpSocket::try_from(socket)?;

    UdpSocket::new(socket)
}

/// A TCP socket factory that hands every new descriptor to a [`Protector`].
///
/// With no protector this is exactly the vanilla [`tcp`] factory. A failed
/// `protect` call is not fatal either: the dial proceeds and the host may
/// refuse the traffic at the network layer, which surfaces as a normal I/O
/// error.
#[derive(Clone)]
pub struct ProtectedTcpFactory {
    protector: Option<Arc<dyn Protector>>,
}

impl ProtectedTcpFactory {
    pub fn new(protector: Option<Arc<dyn Protector>>) -> Self {
        Self { protector }
    }
}

impl SocketFactory<TcpSocket> for ProtectedTcpFactory {
    fn bind(&self, local: SocketAddr) -> io::Result<TcpSocket> {
        let socket = tcp(local)?;

        protect(self.protector.as_deref(), &socket);

        Ok(socket)
    }

    fn reset(&self) {}
}

/// The UDP counterpart of [`ProtectedTcpFactory`].
#[derive(Clone)]
pub struct ProtectedUdpFactory {
    protector: Option<Arc<dyn Protector>>,
}

impl ProtectedUdpFactory {
    pub fn new(protector: Option<Arc<dyn Protector>>) -> Self {
        Self { protector }
    }
}

impl SocketFactory<UdpSocket> for ProtectedUdpFactory {
    fn bind(&self, local: SocketAddr) -> io::Result<UdpSocket> {
        let socket = udp(local)?;

        protect(self.protector.as_deref(), &socket);

        Ok(socket)
    }

    fn reset(&self) {}
}

#[cfg(unix)]
fn protect(protector: Option<&dyn Protector>, socket: &impl std::os::fd::AsRawFd) {
    let Some(protector) = protector else {
        return;
    };

    if !protector.protect(socket.as_raw_fd()) {
        tracing::debug!("Failed to protect socket");
    }
}

#[cfg(not(unix))]
fn protect<S>(_protector: Option<&dyn Protector>, _socket: &S) {}

pub struct TcpSocket {
    inner: tokio::net::TcpSocket,
}

impl TcpSocket {
    pub async fn connect(self, addr: SocketAddr) -> io::Result<TcpStream> {
        let tcp_stream = self.inner.connect(addr).await?;

        Ok(TcpStream { inner: tcp_stream })
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.inner.bind(addr)
    }
}

pub struct TcpStream {
    inner: tokio::net::TcpStream,
}

impl TcpStream {
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Shuts down the read half of the connection.
    ///
    /// Tokio only models write-half shutdown, so this goes through the
    /// descriptor directly. Best-effort: a connection that is already gone
    /// has nothing left to shut down.
    #[cfg(unix)]
    pub fn shutdown_read(&self) {
        use std::os::fd::AsRawFd as _;

        // SAFETY: The fd is owned by `inner` and stays open for &self.
        let rc = unsafe { libc::shutdown(self.inner.as_raw_fd(), libc::SHUT_RD) };

        if rc != 0 {
            tracing::debug!("shutdown(SHUT_RD) failed: {}", io::Error::last_os_error());
        }
    }
}

impl tokio::io::AsyncWrite for TcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.as_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.as_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.as_mut().inner).poll_shutdown(cx)
    }
}

impl tokio::io::AsyncRead for TcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.as_mut().inner).poll_read(cx, buf)
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for TcpSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(unix)]
impl std::os::fd::AsFd for TcpSocket {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
    port: u16,
}

impl UdpSocket {
    fn new(inner: tokio::net::UdpSocket) -> io::Result<Self> {
        let socket_addr = inner.local_addr()?;
        let port = socket_addr.port();

        Ok(UdpSocket { port, inner })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub async fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(payload, dst).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    /// Performs a single request-response handshake with the specified destination socket address.
    ///
    /// This consumes `self` because we want to enforce that we only receive a single message on this socket.
    /// UDP is stateless and therefore, anybody can just send a packet to the destination.
    ///
    /// To simulate a handshake, we therefore only wait for a single message arriving on this socket,
    /// after that, we discard it, freeing up the used source port.
    pub async fn handshake<const BUF_SIZE: usize>(
        self,
        dst: SocketAddr,
        payload: &[u8],
    ) -> io::Result<Vec<u8>> {
        self.inner.send_to(payload, dst).await?;

        let mut buffer = vec![0u8; BUF_SIZE];

        let (num_received, sender) = self.inner.recv_from(&mut buffer).await?;

        // Even though scopes are technically important for link-local IPv6 addresses, they can be ignored for our purposes.
        // We only want to ensure that the reply is from the expected source after we have already received the packet.
        if !is_equal_modulo_scope_for_ipv6_link_local(dst, sender) {
            return Err(io::Error::other(format!(
                "Unexpected reply source: {sender}; expected: {dst}"
            )));
        }

        buffer.truncate(num_received);

        Ok(buffer)
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(unix)]
impl std::os::fd::AsFd for UdpSocket {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

/// Compares the two [`SocketAddr`]s for equality, ignoring IPv6 scopes for link-local addresses.
fn is_equal_modulo_scope_for_ipv6_link_local(expected: SocketAddr, actual: SocketAddr) -> bool {
    match (expected, actual) {
        (SocketAddr::V6(expected), SocketAddr::V6(mut actual))
            if expected.scope_id() == 0 && actual.ip().is_unicast_link_local() =>
        {
            actual.set_scope_id(0);

            expected == actual
        }
        (SocketAddr::V4(expected), SocketAddr::V4(actual)) => expected == actual,
        (SocketAddr::V6(expected), SocketAddr::V6(actual)) => expected == actual,
        (SocketAddr::V6(_), SocketAddr::V4(_)) | (SocketAddr::V4(_), SocketAddr::V6(_)) => false,
    }
}

/// The local wildcard address matching the family of `dst`.
pub fn unspecified_for(dst: SocketAddr) -> SocketAddr {
    match dst {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
    }
}
