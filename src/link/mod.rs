//! The link registry and framing layer.
//!
//! [`LinkMap`] owns every transport socket: one shared listening socket
//! plus one dedicated socket per dialed link. It assigns link ids, frames
//! and deframes the wire protocol, routes inbound payloads to the
//! multiplexer, performs outbound writes on its behalf, and broadcasts the
//! periodic control report over every known link.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use crate::bond::{LinkSender, Mux};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::protocol::{self, FrameType, FrameView};
use crate::proxy::{ProxyConfig, SocksUdpSocket};
use crate::transport::{self, DialedUdp, LinkSocket, SocketTuning};
use crate::types::LinkId;
use crate::MAX_DATAGRAM;

/// Link registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How often the control report is broadcast over every link.
    #[serde(default = "default_control_interval", with = "humantime_serde")]
    pub control_interval: Duration,

    /// Socket send buffer size.
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,

    /// Socket receive buffer size.
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,
}

fn default_control_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_buffer_size() -> usize {
    1 << 20
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            control_interval: default_control_interval(),
            send_buffer_size: default_buffer_size(),
            recv_buffer_size: default_buffer_size(),
        }
    }
}

impl LinkConfig {
    fn tuning(&self) -> SocketTuning {
        SocketTuning {
            send_buffer: self.send_buffer_size,
            recv_buffer: self.recv_buffer_size,
        }
    }
}

/// How frames reach one link's peer.
enum LinkConn {
    /// Dedicated socket, dialed by us (raw UDP or via a proxy).
    Dialed(Arc<dyn LinkSocket>),
    /// Learned passively: frames go out through the shared listener to the
    /// last address the peer was seen at.
    ViaListener,
}

struct LinkEntry {
    conn: LinkConn,
    /// Known remote address; absent until learned for proxied links.
    addr: Option<SocketAddr>,
}

/// All mutable registry state, guarded by one lock shared across the
/// read-loop workers and the control broadcast task. Held only for table
/// lookups and mutations, never across a socket operation.
struct Registry {
    listener: Option<Arc<UdpSocket>>,
    next_id: u16,
    links: HashMap<LinkId, LinkEntry>,
}

/// The link registry and framer.
pub struct LinkMap {
    mux: Arc<Mux>,
    config: LinkConfig,
    proxy_config: ProxyConfig,
    registry: Mutex<Registry>,
}

impl LinkMap {
    pub fn new(mux: Arc<Mux>, config: LinkConfig, proxy_config: ProxyConfig) -> Arc<Self> {
        Arc::new(Self {
            mux,
            config,
            proxy_config,
            registry: Mutex::new(Registry {
                listener: None,
                next_id: 0,
                links: HashMap::new(),
            }),
        })
    }

    /// Open the shared listening socket and start its read loop. Links
    /// announce themselves here by sending frames with ids we have not
    /// seen yet.
    pub fn start_listener(self: &Arc<Self>, port: u16) -> Result<()> {
        let socket = Arc::new(transport::bind_listener(port, &self.config.tuning())?);
        info!(addr = %socket.local_addr()?, "listening for links");
        self.registry.lock().listener = Some(Arc::clone(&socket));
        self.spawn_listener_loop(socket);
        Ok(())
    }

    /// Local address of the shared listener, if one is running.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        let registry = self.registry.lock();
        let listener = registry.listener.as_ref()?;
        listener.local_addr().ok()
    }

    /// Dial a fixed peer over raw UDP and register the new link.
    pub async fn initiate_link(self: &Arc<Self>, target: &str) -> Result<LinkId> {
        let addr = transport::resolve(target).await?;
        let socket = DialedUdp::connect(addr, &self.config.tuning()).await?;
        self.register_dialed(Arc::new(socket), Some(addr))
    }

    /// Dial a fixed peer through a SOCKS5 proxy's UDP relay and register
    /// the new link.
    pub async fn initiate_link_via_proxy(
        self: &Arc<Self>,
        proxy: &str,
        target: &str,
    ) -> Result<LinkId> {
        let socket = SocksUdpSocket::connect(proxy, target, &self.proxy_config).await?;
        self.register_dialed(socket, None)
    }

    fn register_dialed(
        self: &Arc<Self>,
        socket: Arc<dyn LinkSocket>,
        addr: Option<SocketAddr>,
    ) -> Result<LinkId> {
        let id = {
            let mut registry = self.registry.lock();
            if registry.next_id >= LinkId::MAX {
                return Err(Error::LinkCapacityExceeded);
            }
            registry.next_id += 1;
            let id = LinkId(registry.next_id);
            self.mux.add_link(id);
            registry.links.insert(
                id,
                LinkEntry {
                    conn: LinkConn::Dialed(Arc::clone(&socket)),
                    addr,
                },
            );
            id
        };
        info!(link = %id, ?addr, "initiated link");
        self.spawn_link_loop(id, socket);
        Ok(id)
    }

    /// Wrap a payload in a data frame and write it on `link`'s socket.
    pub async fn send(&self, link: LinkId, payload: &[u8]) -> Result<()> {
        let frame = protocol::encode(FrameType::Data, link, payload);
        self.transmit(link, &frame).await
    }

    /// Broadcast the control report forever. Spawn this once next to the
    /// read loops.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.control_interval);
        loop {
            ticker.tick().await;
            self.broadcast_control().await;
        }
    }

    async fn broadcast_control(&self) {
        let report = match self.mux.craft_control() {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "failed to craft control report");
                return;
            }
        };
        let ids: Vec<LinkId> = self.registry.lock().links.keys().copied().collect();
        for id in ids {
            let frame = protocol::encode(FrameType::Control, id, &report);
            if let Err(e) = self.transmit(id, &frame).await {
                debug!(link = %id, error = %e, "control send failed");
            }
        }
    }

    /// Write an already-framed datagram on one link. "Send buffer full"
    /// is a transient non-error: the packet is simply dropped.
    async fn transmit(&self, link: LinkId, frame: &[u8]) -> Result<()> {
        enum Target {
            Dialed(Arc<dyn LinkSocket>),
            Listener(Arc<UdpSocket>, SocketAddr),
        }

        let target = {
            let registry = self.registry.lock();
            let entry = registry
                .links
                .get(&link)
                .ok_or(Error::LinkNotFound(link))?;
            match &entry.conn {
                LinkConn::Dialed(socket) => Target::Dialed(Arc::clone(socket)),
                LinkConn::ViaListener => {
                    let addr = entry.addr.ok_or(Error::LinkNotFound(link))?;
                    let listener = registry
                        .listener
                        .as_ref()
                        .map(Arc::clone)
                        .ok_or(Error::LinkNotFound(link))?;
                    Target::Listener(listener, addr)
                }
            }
        };

        let written = match target {
            Target::Dialed(socket) => socket.write(frame).await,
            Target::Listener(listener, addr) => listener.send_to(frame, addr).await,
        };

        match written {
            Ok(_) => Ok(()),
            Err(e) if is_buffer_exhausted(&e) => {
                trace!(link = %link, "send buffer full, dropping packet");
                Ok(())
            }
            Err(e) => Err(TransportError::SendFailed(e.to_string()).into()),
        }
    }

    fn spawn_listener_loop(self: &Arc<Self>, socket: Arc<UdpSocket>) {
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        // Frames on the listener self-declare their link,
                        // so a mismatch cannot occur and this never fails.
                        let _ = map.handle_frame(None, from, &buf[..n]).await;
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        // ICMP port-unreachable bleeding through; the peer
                        // is transiently gone, keep reading.
                    }
                    Err(e) => warn!(error = %e, "listener read failed"),
                }
            }
        });
    }

    fn spawn_link_loop(self: &Arc<Self>, id: LinkId, socket: Arc<dyn LinkSocket>) {
        let map = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.read_datagram(&mut buf).await {
                    Ok((n, from)) => {
                        if map.handle_frame(Some(id), from, &buf[..n]).await.is_err() {
                            error!(link = %id, "terminating link after protocol violation");
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
                    Err(e) => warn!(link = %id, error = %e, "link read failed"),
                }
            }
        });
    }

    /// Handle one inbound datagram.
    ///
    /// `source` is the link the socket is dedicated to, or `None` for the
    /// shared listener (the declared id is learned from the wire there).
    /// Malformed datagrams are logged and dropped; the only error returned
    /// is the fatal-per-link id mismatch.
    async fn handle_frame(
        &self,
        source: Option<LinkId>,
        from: SocketAddr,
        datagram: &[u8],
    ) -> Result<()> {
        let frame = match FrameView::parse(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed frame");
                return Ok(());
            }
        };
        let declared = frame.link;

        if let Some(expected) = source {
            if declared != expected {
                error!(
                    link = %expected,
                    declared = %declared,
                    %from,
                    "frame declares a different link on a dedicated socket"
                );
                return Err(ProtocolError::LinkIdMismatch {
                    expected,
                    got: declared,
                }
                .into());
            }
        }

        {
            let mut registry = self.registry.lock();
            if !registry.links.contains_key(&declared) {
                // Only reachable from the listener: dedicated sockets have
                // passed the id check, and their ids are registered.
                info!(link = %declared, %from, "learned new link");
                self.mux.add_link(declared);
                registry.links.insert(
                    declared,
                    LinkEntry {
                        conn: LinkConn::ViaListener,
                        addr: Some(from),
                    },
                );
            } else if source.is_none() {
                // Refresh the return path on every listener frame so a
                // peer re-binding behind a NAT keeps working.
                if let Some(entry) = registry.links.get_mut(&declared) {
                    entry.conn = LinkConn::ViaListener;
                    entry.addr = Some(from);
                }
            }
        }

        match frame.kind {
            FrameType::Control => self.mux.handle_control(declared, frame.payload),
            FrameType::Data => {
                if let Err(e) = self.mux.received(declared, frame.payload).await {
                    warn!(link = %declared, error = %e, "failed to deliver packet upward");
                }
            }
        }
        Ok(())
    }

    /// Number of currently known links.
    pub fn link_count(&self) -> usize {
        self.registry.lock().links.len()
    }
}

#[async_trait]
impl LinkSender for LinkMap {
    async fn send(&self, link: LinkId, payload: &[u8]) -> Result<()> {
        LinkMap::send(self, link, payload).await
    }
}

fn is_buffer_exhausted(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock) || e.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bond::{BondConfig, PacketSink};
    use crate::metrics::NoopObserver;
    use crate::protocol::FRAME_MAGIC;

    #[derive(Default)]
    struct RecordingSink {
        packets: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            self.packets.lock().push(packet.to_vec());
            Ok(())
        }
    }

    fn bonded_endpoint() -> (Arc<Mux>, Arc<LinkMap>, Arc<RecordingSink>) {
        let mux = Arc::new(Mux::new(BondConfig::default(), Arc::new(NoopObserver)));
        let map = LinkMap::new(
            Arc::clone(&mux),
            LinkConfig::default(),
            ProxyConfig::default(),
        );
        let sink = Arc::new(RecordingSink::default());
        mux.bind(sink.clone(), map.clone());
        (mux, map, sink)
    }

    #[tokio::test]
    async fn link_ids_are_sequential_and_capped() {
        let (_, map, _) = bonded_endpoint();
        for expected in 1..=LinkId::MAX {
            let id = map.initiate_link("127.0.0.1:9").await.unwrap();
            assert_eq!(id, LinkId(expected));
        }
        // The 256th initiate must fail, not wrap around or reuse an id.
        assert!(matches!(
            map.initiate_link("127.0.0.1:9").await,
            Err(Error::LinkCapacityExceeded)
        ));
        assert_eq!(map.link_count(), usize::from(LinkId::MAX));
    }

    #[tokio::test]
    async fn short_frame_leaves_registry_unchanged() {
        let (_, map, _) = bonded_endpoint();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        map.handle_frame(None, from, &[0x42]).await.unwrap();
        map.handle_frame(None, from, &[]).await.unwrap();
        assert_eq!(map.link_count(), 0);
    }

    #[tokio::test]
    async fn bad_magic_and_unknown_type_are_dropped() {
        let (_, map, _) = bonded_endpoint();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        map.handle_frame(None, from, &[b'X', b'Y', b'D', 1, 9])
            .await
            .unwrap();
        map.handle_frame(None, from, &[FRAME_MAGIC[0], FRAME_MAGIC[1], b'Z', 1, 9])
            .await
            .unwrap();
        assert_eq!(map.link_count(), 0);
    }

    #[tokio::test]
    async fn id_mismatch_on_dedicated_link_is_a_protocol_violation() {
        let (_, map, _) = bonded_endpoint();
        let link = map.initiate_link("127.0.0.1:9").await.unwrap();
        let from: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let wrong = protocol::encode(FrameType::Data, LinkId(200), b"x");
        let err = map.handle_frame(Some(link), from, &wrong).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::LinkIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn listener_learns_links_reactively() {
        let (mux, map, sink) = bonded_endpoint();
        map.start_listener(0).unwrap();
        let from: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        let data = protocol::encode(FrameType::Data, LinkId(7), b"first packet");
        map.handle_frame(None, from, &data).await.unwrap();

        assert_eq!(map.link_count(), 1);
        assert_eq!(mux.snapshot()[0].id, LinkId(7));
        assert_eq!(
            sink.packets.lock().as_slice(),
            &[b"first packet".to_vec()]
        );
    }

    #[tokio::test]
    async fn data_flows_between_two_endpoints() {
        let (mux_a, map_a, sink_a) = bonded_endpoint();
        let (mux_b, map_b, sink_b) = bonded_endpoint();

        map_b.start_listener(0).unwrap();
        let port = map_b.listener_addr().unwrap().port();
        map_a
            .initiate_link(&format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        mux_a.send(b"ping").await.unwrap();
        wait_for(|| !sink_b.packets.lock().is_empty()).await;
        assert_eq!(sink_b.packets.lock().as_slice(), &[b"ping".to_vec()]);

        // B learned the link from A's first packet and can answer over it.
        mux_b.send(b"pong").await.unwrap();
        wait_for(|| !sink_a.packets.lock().is_empty()).await;
        assert_eq!(sink_a.packets.lock().as_slice(), &[b"pong".to_vec()]);
    }

    #[tokio::test]
    async fn control_reports_cross_between_endpoints() {
        let (mux_a, map_a, _sink_a) = bonded_endpoint();
        let (mux_b, map_b, sink_b) = bonded_endpoint();

        map_b.start_listener(0).unwrap();
        let port = map_b.listener_addr().unwrap().port();
        map_a
            .initiate_link(&format!("127.0.0.1:{port}"))
            .await
            .unwrap();

        // One data packet teaches B the link.
        mux_a.send(&[0u8; 100]).await.unwrap();
        wait_for(|| !sink_b.packets.lock().is_empty()).await;

        // One control broadcast from B tells A its bytes arrived; A's
        // delivery rate for the link becomes positive.
        map_b.broadcast_control().await;
        wait_for(|| mux_a.snapshot()[0].rate > 0.0).await;
        assert!(mux_a.snapshot()[0].rate >= 1.0);
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }
}
