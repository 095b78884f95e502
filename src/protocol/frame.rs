//! The four-byte frame header and its codec.

use crate::error::ProtocolError;
use crate::types::LinkId;

/// Leading magic of every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"BL";

/// Header length: magic, frame type, link id.
pub const FRAME_HEADER_LEN: usize = 4;

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Serialized control report.
    Control,
    /// Opaque upper-layer packet.
    Data,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            b'C' => Some(Self::Control),
            b'D' => Some(Self::Data),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Control => b'C',
            Self::Data => b'D',
        }
    }
}

/// Encode a frame into a fresh buffer.
pub fn encode(kind: FrameType, link: LinkId, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.push(kind.as_u8());
    buf.push(link.wire());
    buf.extend_from_slice(payload);
    buf
}

/// Borrowed view of a decoded frame.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameView<'a> {
    pub kind: FrameType,
    /// Link id the sender declared for this frame.
    pub link: LinkId,
    pub payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Parse a received datagram. Short or malformed datagrams yield a
    /// typed error; the caller decides whether that is fatal (it never is
    /// for frames off the wire, which are logged and dropped).
    pub fn parse(datagram: &'a [u8]) -> Result<Self, ProtocolError> {
        if datagram.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::ShortFrame(datagram.len()));
        }
        if datagram[..2] != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic([datagram[0], datagram[1]]));
        }
        let kind = FrameType::from_u8(datagram[2])
            .ok_or(ProtocolError::UnknownFrameType(datagram[2]))?;
        Ok(Self {
            kind,
            link: LinkId::from_wire(datagram[3]),
            payload: &datagram[FRAME_HEADER_LEN..],
        })
    }
}
