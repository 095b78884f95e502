//! Error types for Linkweave.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::LinkId;

/// Result type alias for Linkweave operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Linkweave.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No link was available to carry a packet.
    #[error("no links available")]
    NoLinksAvailable,

    /// The one-byte link id space is exhausted.
    #[error("link id space exhausted ({} links active)", LinkId::MAX)]
    LinkCapacityExceeded,

    #[error("link {0} not found")]
    LinkNotFound(LinkId),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: SocketAddr, reason: String },

    #[error("address resolution failed for {0}")]
    ResolveFailed(String),

    #[error("socket setup failed: {0}")]
    Setup(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("SOCKS handshake failed: {0}")]
    ProxyHandshake(String),
}

/// Wire protocol parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short frame: {0} bytes")]
    ShortFrame(usize),

    #[error("bad frame magic: {0:02x?}")]
    BadMagic([u8; 2]),

    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// A dedicated link socket received a frame declaring a different link.
    /// This is a protocol violation; the affected link must not keep running.
    #[error("frame for link {got} arrived on link {expected}")]
    LinkIdMismatch { expected: LinkId, got: LinkId },

    #[error("control report encode failed: {0}")]
    ControlEncode(String),

    #[error("control report decode failed: {0}")]
    ControlDecode(String),
}
