//! The datagram-socket capability bonded links are built on.
//!
//! A link transport only has to do two things: write a datagram to the
//! peer and read a datagram along with its sender. Raw connected UDP
//! sockets implement this directly; the SOCKS5 adapter implements it by
//! wrapping datagrams for a relay.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Result, TransportError};

/// Bidirectional datagram transport for one link.
#[async_trait]
pub trait LinkSocket: Send + Sync {
    /// Write one datagram to the peer.
    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Read one datagram, returning its length and sender address.
    async fn read_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Socket buffer tuning applied to every UDP socket we create.
#[derive(Debug, Clone, Copy)]
pub struct SocketTuning {
    pub send_buffer: usize,
    pub recv_buffer: usize,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            send_buffer: 1 << 20,
            recv_buffer: 1 << 20,
        }
    }
}

/// A connected UDP socket dialed at a fixed peer.
pub struct DialedUdp {
    socket: UdpSocket,
}

impl DialedUdp {
    pub async fn connect(remote: SocketAddr, tuning: &SocketTuning) -> Result<Self> {
        let bind = if remote.is_ipv6() {
            SocketAddr::from(([0u8; 16], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let socket = create_udp_socket(bind, tuning)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(|e| TransportError::BindFailed {
            addr: bind,
            reason: e.to_string(),
        })?;
        socket
            .connect(remote)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                addr: remote,
                reason: e.to_string(),
            })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl LinkSocket for DialedUdp {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }

    async fn read_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

/// Create a tuned, non-blocking std UDP socket bound to `addr`.
pub(crate) fn create_udp_socket(addr: SocketAddr, tuning: &SocketTuning) -> Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::Setup(e.to_string()))?;

    // Buffer sizing is best effort; some environments clamp it.
    if let Err(e) = socket.set_send_buffer_size(tuning.send_buffer) {
        debug!(error = %e, "could not set send buffer size");
    }
    if let Err(e) = socket.set_recv_buffer_size(tuning.recv_buffer) {
        debug!(error = %e, "could not set recv buffer size");
    }

    if addr.is_ipv6() {
        socket
            .set_only_v6(false)
            .map_err(|e| TransportError::Setup(e.to_string()))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::Setup(e.to_string()))?;

    Ok(socket)
}

/// Bind the shared listening socket (dual-stack where the platform
/// allows it).
pub fn bind_listener(port: u16, tuning: &SocketTuning) -> Result<UdpSocket> {
    let addr = SocketAddr::from(([0u8; 16], port));
    let socket = create_udp_socket(addr, tuning)?;
    UdpSocket::from_std(socket.into())
        .map_err(|e| {
            TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            }
            .into()
        })
}

/// Resolve a `host:port` string to its first address.
pub async fn resolve(hostport: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(hostport)
        .await
        .map_err(|_| TransportError::ResolveFailed(hostport.to_string()))?
        .next()
        .ok_or_else(|| TransportError::ResolveFailed(hostport.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dialed_udp_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let dialed = DialedUdp::connect(peer_addr, &SocketTuning::default())
            .await
            .unwrap();
        dialed.write(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        peer.send_to(b"pong", from).await.unwrap();
        let (n, sender) = dialed.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(sender, peer_addr);
    }

    #[tokio::test]
    async fn resolve_rejects_garbage() {
        assert!(resolve("definitely not an address").await.is_err());
    }

    #[tokio::test]
    async fn listener_binds_ephemeral_port() {
        let listener = bind_listener(0, &SocketTuning::default()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
