//! Glue between a TUN device, a user-space IP engine and the DoH resolver.
//!
//! The engine does all L3/L4 work; this crate supplies its two capability
//! ports: a [`StreamDialer`] for accepted TCP flows and a [`PacketProxy`]
//! for UDP associations. Traffic aimed at the configured fake-DNS endpoint
//! is diverted into the current [`doh::Transport`]; everything else is
//! relayed to its real destination.

mod bridge;
mod dialer;
mod dot;
mod packet;
mod stats;

pub use bridge::{IpReader, IpWriter};
pub use dialer::{DuplexStream, StreamDialer};
pub use packet::{PacketProxy, PacketResponder, PacketSender};
pub use stats::{TcpSummary, UdpSummary};

use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use doh::Transport;
use socket_factory::{SocketFactory, TcpSocket, UdpSocket};
use tokio::task::JoinHandle;
use tun::Tun;

/// Host-facing event sink for the whole tunnel.
pub trait TunnelListener: doh::QueryListener {
    /// Called exactly once when a relayed TCP flow closes.
    fn on_tcp_socket_closed(&self, summary: &TcpSummary) {
        let _ = summary;
    }

    /// Called exactly once when a UDP association closes.
    fn on_udp_socket_closed(&self, summary: &UdpSummary) {
        let _ = summary;
    }
}

/// The swappable slot holding the active DoH transport.
///
/// Readers load an `Arc` and keep using it; a store is a total replacement
/// and never tears. There is no empty state: the session is constructed
/// with a transport and swaps never remove it.
pub(crate) type DohSlot = ArcSwap<Arc<dyn Transport>>;

/// A running tunnel session.
pub struct Session {
    doh: Arc<DohSlot>,
    uplink: JoinHandle<()>,
    downlink: JoinHandle<()>,
}

impl Session {
    /// Wires everything together and starts the TUN bridge.
    ///
    /// `tun_rx`/`tun_tx` are two handles onto the same device (e.g. via
    /// [`tun::FdTun::try_clone`]), one per copy direction. `engine`
    /// receives the relay's capability ports and returns the engine's IP
    /// device halves.
    pub fn connect<F>(
        tun_rx: Box<dyn Tun>,
        tun_tx: Box<dyn Tun>,
        fake_dns: SocketAddr,
        doh: Arc<dyn Transport>,
        tcp_factory: Arc<dyn SocketFactory<TcpSocket>>,
        udp_factory: Arc<dyn SocketFactory<UdpSocket>>,
        listener: Option<Arc<dyn TunnelListener>>,
        engine: F,
    ) -> Self
    where
        F: FnOnce(Arc<dyn StreamDialer>, Arc<dyn PacketProxy>) -> (Box<dyn IpReader>, Box<dyn IpWriter>),
    {
        let slot = Arc::new(ArcSwap::from_pointee(doh));

        let dialer = Arc::new(dialer::IntraStreamDialer::new(
            fake_dns,
            slot.clone(),
            tcp_factory,
            listener.clone(),
        ));
        let proxy = Arc::new(packet::IntraPacketProxy::new(
            fake_dns,
            slot.clone(),
            udp_factory,
            listener,
        ));

        let (engine_rx, engine_tx) = engine(dialer, proxy);

        let (uplink, downlink) = bridge::spawn(tun_rx, tun_tx, engine_rx, engine_tx);

        Self {
            doh: slot,
            uplink,
            downlink,
        }
    }

    /// Atomically replaces the DoH transport, e.g. after a network change.
    ///
    /// In-flight queries finish on the transport they started with; new
    /// queries see the replacement.
    pub fn update_doh(&self, doh: Arc<dyn Transport>) {
        self.doh.store(Arc::new(doh));
    }

    /// The currently active DoH transport.
    pub fn doh(&self) -> Arc<dyn Transport> {
        self.doh.load_full().as_ref().clone()
    }

    /// Stops the TUN bridge. Per-flow tasks drain on their own.
    pub fn disconnect(&self) {
        self.uplink.abort();
        self.downlink.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}
