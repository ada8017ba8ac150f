//! The datagram substrate the protocol engine runs on.
//!
//! The engine only ever needs two capabilities: fire one datagram at the peer,
//!  and wait for the next datagram with a time bound. Everything else -
//!  retransmission, ordering, windowing - lives above this seam. Keeping the
//!  seam this narrow is what lets tests swap in an in-memory link or a fault
//!  injector without touching the engine.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::config::MAX_PACKET_SIZE;

/// One datagram send/receive capability, bound to a single peer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one datagram to the peer. An error here means the local transport
    ///  itself failed - loss on the network does not show up as an error.
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// Waits for the next datagram from the peer, giving up after `timeout`.
    ///  `Ok(None)` means the window elapsed without traffic.
    async fn recv_datagram(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>>;
}

/// The real thing: a connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Binds an ephemeral local socket and connects it to `peer`, so the OS
    ///  filters out datagrams from other sources.
    pub async fn connect(peer: SocketAddr) -> anyhow::Result<UdpTransport> {
        let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        info!("bound datagram socket {:?} for peer {:?}", socket.local_addr()?, peer);

        Ok(UdpTransport { socket, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        let sent = self.socket.send(buf).await?;
        if sent != buf.len() {
            anyhow::bail!("datagram truncated on send: {} of {} bytes", sent, buf.len());
        }
        Ok(())
    }

    async fn recv_datagram(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        // one byte of headroom so oversized datagrams fail decoding instead of
        //  being silently truncated to a parseable length
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                trace!("received {} byte datagram", len);
                buf.truncate(len);
                Ok(Some(buf.into()))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Ok(None),
        }
    }
}
