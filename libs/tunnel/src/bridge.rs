use std::io;

use tokio::task::JoinHandle;
use tun::Tun;

/// Reads IP packets the engine wants delivered to the TUN device.
#[async_trait::async_trait]
pub trait IpReader: Send + 'static {
    async fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Accepts IP packets arriving from the TUN device.
#[async_trait::async_trait]
pub trait IpWriter: Send + 'static {
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;
}

const MTU: usize = 1500;

/// Starts the two copy tasks between TUN and the engine's IP device.
pub(crate) fn spawn(
    mut tun_rx: Box<dyn Tun>,
    mut tun_tx: Box<dyn Tun>,
    mut engine_rx: Box<dyn IpReader>,
    mut engine_tx: Box<dyn IpWriter>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let uplink = tokio::spawn(async move {
        let mut buf = [0u8; MTU];

        loop {
            let n = match tun_rx.recv(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("TUN device reached EOF");

                    return;
                }
                Ok(n) => n,
                Err(e) if is_closed(&e) => {
                    tracing::debug!("TUN device closed: {e}");

                    return;
                }
                Err(e) => {
                    // A single bad read must not take the tunnel down.
                    tracing::warn!("TUN read failed, continuing: {e}");

                    continue;
                }
            };

            match engine_tx.write_packet(&buf[..n]).await {
                Ok(_) => {}
                Err(e) if is_closed(&e) => {
                    tracing::debug!("IP engine closed: {e}");

                    return;
                }
                Err(e) => tracing::debug!("Dropping inbound packet: {e}"),
            }
        }
    });

    let downlink = tokio::spawn(async move {
        let mut buf = [0u8; MTU];

        loop {
            let n = match engine_rx.read_packet(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("IP engine reached EOF");

                    return;
                }
                Ok(n) => n,
                Err(e) if is_closed(&e) => {
                    tracing::debug!("IP engine closed: {e}");

                    return;
                }
                Err(e) => {
                    tracing::warn!("Engine read failed, continuing: {e}");

                    continue;
                }
            };

            match tun_tx.send(&buf[..n]).await {
                Ok(_) => {}
                Err(e) if is_closed(&e) => {
                    tracing::debug!("TUN device closed: {e}");

                    return;
                }
                Err(e) => tracing::debug!("Dropping outbound packet: {e}"),
            }
        }
    });

    (uplink, downlink)
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
