use std::io;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::FdTun;

/// A TUN device carrying whole IP packets, one per call.
#[async_trait::async_trait]
pub trait Tun: Send + 'static {
    /// Receives one IP packet into `buf`, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Sends one IP packet.
    async fn send(&mut self, packet: &[u8]) -> io::Result<usize>;

    /// The name of the TUN device.
    fn name(&self) -> &str;
}
