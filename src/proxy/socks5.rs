//! UDP relayed through a SOCKS5 proxy (RFC 1928 UDP ASSOCIATE).
//!
//! The proxy hands out a UDP relay address over a TCP control connection;
//! datagrams to the relay carry a small wrapper naming the final
//! destination. The relay only stays valid while the control connection
//! lives, so a supervisor task keeps it alive and re-runs the handshake
//! with a fixed backoff whenever it drops. The local UDP socket persists
//! across reconnects; the bonded link on top never notices.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::transport::{resolve, LinkSocket};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ADDR_IPV4: u8 = 0x01;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Smallest possible relay wrapper: RSV(2) + FRAG(1) + ATYP(1) + IPv4(4) +
/// port(2).
const MIN_WRAPPER_LEN: usize = 10;

/// Proxy transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Delay between control-connection attempts.
    #[serde(default = "default_reconnect_backoff", with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// TCP keep-alive probe period on the control connection.
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}
fn default_keepalive_interval() -> Duration {
    Duration::from_secs(4)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: default_reconnect_backoff(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// A [`LinkSocket`] that tunnels datagrams through a SOCKS5 proxy's UDP
/// relay.
pub struct SocksUdpSocket {
    udp: UdpSocket,
    /// Final destination the relay forwards our datagrams to.
    target: SocketAddr,
    /// Current relay address; refreshed by the supervisor on every
    /// successful associate, kept stale across reconnects so writes stay
    /// best-effort in the gap.
    relay: RwLock<Option<SocketAddr>>,
}

impl SocksUdpSocket {
    /// Open the local UDP socket and start the control-channel supervisor.
    /// Returns immediately; until the first associate completes, writes
    /// fail like any other transient link error.
    pub async fn connect(proxy: &str, target: &str, config: &ProxyConfig) -> Result<Arc<Self>> {
        let proxy_addr = resolve(proxy).await?;
        let target_addr = resolve(target).await?;
        let udp = UdpSocket::bind(SocketAddr::from(([0u8; 4], 0)))
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: SocketAddr::from(([0u8; 4], 0)),
                reason: e.to_string(),
            })?;

        let socket = Arc::new(Self {
            udp,
            target: target_addr,
            relay: RwLock::new(None),
        });

        tokio::spawn(Arc::clone(&socket).supervise(proxy_addr, config.clone()));
        Ok(socket)
    }

    /// Keep the TCP control connection alive forever. Each pass performs
    /// the handshake, then parks on the connection until it dies; any
    /// failure waits out the backoff and starts over.
    async fn supervise(self: Arc<Self>, proxy_addr: SocketAddr, config: ProxyConfig) {
        let mut scratch = [0u8; 128];
        loop {
            match self.associate(proxy_addr, &config).await {
                Ok(mut control) => match control.read(&mut scratch).await {
                    Ok(0) => debug!(proxy = %proxy_addr, "proxy control connection closed"),
                    Ok(n) => debug!(
                        proxy = %proxy_addr,
                        bytes = n,
                        "unexpected data on proxy control connection"
                    ),
                    Err(e) => debug!(proxy = %proxy_addr, error = %e, "proxy control connection failed"),
                },
                Err(e) => warn!(proxy = %proxy_addr, error = %e, "proxy associate failed"),
            }
            tokio::time::sleep(config.reconnect_backoff).await;
        }
    }

    /// One full SOCKS5 handshake: greeting, then UDP ASSOCIATE for our
    /// local UDP socket. On success the relay address is swapped in and
    /// the keep-alive'd control connection is returned.
    async fn associate(
        &self,
        proxy_addr: SocketAddr,
        config: &ProxyConfig,
    ) -> Result<TcpStream> {
        let mut stream =
            TcpStream::connect(proxy_addr)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    addr: proxy_addr,
                    reason: e.to_string(),
                })?;

        let keepalive = TcpKeepalive::new().with_time(config.keepalive_interval);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            debug!(error = %e, "could not enable TCP keep-alive");
        }

        stream
            .write_all(&[SOCKS_VERSION, 1, AUTH_NONE])
            .await
            .map_err(|e| TransportError::ProxyHandshake(format!("greeting write: {e}")))?;

        let mut greeting = [0u8; 2];
        stream
            .read_exact(&mut greeting)
            .await
            .map_err(|e| TransportError::ProxyHandshake(format!("greeting read: {e}")))?;
        if greeting != [SOCKS_VERSION, AUTH_NONE] {
            return Err(TransportError::ProxyHandshake(format!(
                "unexpected greeting reply {greeting:02x?}"
            ))
            .into());
        }

        // The proxy needs to know where our datagrams will come from. An
        // unspecified local IP is substituted with the address the control
        // connection happens to use.
        let mut local = self
            .udp
            .local_addr()
            .map_err(|e| TransportError::Setup(e.to_string()))?;
        if local.ip().is_unspecified() {
            let tcp_local = stream
                .local_addr()
                .map_err(|e| TransportError::Setup(e.to_string()))?;
            local.set_ip(tcp_local.ip());
        }

        let mut request = Vec::with_capacity(3 + host_port_len(&local));
        request.extend_from_slice(&[SOCKS_VERSION, CMD_UDP_ASSOCIATE, 0x00]);
        encode_host_port(&mut request, &local);
        stream
            .write_all(&request)
            .await
            .map_err(|e| TransportError::ProxyHandshake(format!("associate write: {e}")))?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream
            .read_exact(&mut head)
            .await
            .map_err(|e| TransportError::ProxyHandshake(format!("associate read: {e}")))?;
        if head[0] != SOCKS_VERSION {
            return Err(TransportError::ProxyHandshake(format!(
                "unexpected version {} in associate reply",
                head[0]
            ))
            .into());
        }
        if head[1] != REPLY_SUCCEEDED {
            return Err(TransportError::ProxyHandshake(format!(
                "associate rejected with status {}",
                head[1]
            ))
            .into());
        }

        let mut relay = match head[3] {
            ADDR_IPV4 => {
                let mut rest = [0u8; 6];
                stream
                    .read_exact(&mut rest)
                    .await
                    .map_err(|e| TransportError::ProxyHandshake(format!("relay addr read: {e}")))?;
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            }
            ADDR_IPV6 => {
                let mut rest = [0u8; 18];
                stream
                    .read_exact(&mut rest)
                    .await
                    .map_err(|e| TransportError::ProxyHandshake(format!("relay addr read: {e}")))?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
            other => {
                return Err(TransportError::ProxyHandshake(format!(
                    "unsupported relay address type {other}"
                ))
                .into())
            }
        };

        // Some proxies advertise an unspecified relay IP meaning "same
        // host as the proxy itself".
        if relay.ip().is_unspecified() {
            relay.set_ip(proxy_addr.ip());
        }

        *self.relay.write() = Some(relay);
        info!(proxy = %proxy_addr, relay = %relay, "proxy UDP associate established");
        Ok(stream)
    }
}

#[async_trait]
impl LinkSocket for SocksUdpSocket {
    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let relay = *self.relay.read();
        let Some(relay) = relay else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "SOCKS relay not established yet",
            ));
        };

        let mut datagram = Vec::with_capacity(3 + host_port_len(&self.target) + buf.len());
        datagram.extend_from_slice(&[0x00, 0x00, 0x00]); // RSV, RSV, FRAG
        encode_host_port(&mut datagram, &self.target);
        let overhead = datagram.len();
        datagram.extend_from_slice(buf);

        let n = self.udp.send_to(&datagram, relay).await?;
        Ok(n.saturating_sub(overhead))
    }

    async fn read_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let (n, _) = self.udp.recv_from(buf).await?;
            match strip_wrapper(&buf[..n]) {
                Ok((offset, sender)) => {
                    buf.copy_within(offset..n, 0);
                    return Ok((n - offset, sender));
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed relay datagram");
                }
            }
        }
    }
}

fn host_port_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 7,
        SocketAddr::V6(_) => 19,
    }
}

/// Append a SOCKS5 address block (ATYP + address + big-endian port).
fn encode_host_port(buf: &mut Vec<u8>, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.push(ADDR_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.push(ADDR_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
    }
    buf.extend_from_slice(&addr.port().to_be_bytes());
}

/// Decode a SOCKS5 address block; returns the address and its encoded
/// length.
fn decode_host_port(buf: &[u8]) -> io::Result<(SocketAddr, usize)> {
    match buf.first() {
        Some(&ADDR_IPV4) if buf.len() >= 7 => {
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok((SocketAddr::new(IpAddr::V4(ip), port), 7))
        }
        Some(&ADDR_IPV6) if buf.len() >= 19 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok((SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port), 19))
        }
        Some(&other) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("address type should be {ADDR_IPV4} or {ADDR_IPV6}, was {other}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "empty address block",
        )),
    }
}

/// Validate and measure the relay wrapper on an inbound datagram; returns
/// the payload offset and the sender the relay reported.
fn strip_wrapper(datagram: &[u8]) -> io::Result<(usize, SocketAddr)> {
    if datagram.len() < MIN_WRAPPER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "relay datagram too short",
        ));
    }
    if datagram[0] != 0 || datagram[1] != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "nonzero reserved bytes in relay wrapper",
        ));
    }
    if datagram[2] != 0 {
        // Fragmented relay datagrams are unsupported by design.
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "fragmented relay datagram",
        ));
    }
    let (sender, addr_len) = decode_host_port(&datagram[3..])?;
    Ok((3 + addr_len, sender))
}
