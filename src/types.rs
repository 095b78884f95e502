//! Small shared types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one bonded link.
///
/// Link ids live in `[1, 255]` on the wire (one byte in the frame header)
/// but are carried as `u16` internally so an id can never collide through
/// accidental truncation; narrowing happens only at the frame codec.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LinkId(pub u16);

impl LinkId {
    /// Highest id representable in the one-byte wire encoding.
    pub const MAX: u16 = 255;

    /// Narrow to the one-byte wire representation (modulo 256).
    pub fn wire(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Widen from the one-byte wire representation.
    pub fn from_wire(b: u8) -> Self {
        Self(u16::from(b))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time view of one link's statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkSnapshot {
    pub id: LinkId,
    /// Bytes sent over the link within the trailing stats window.
    pub sent_bytes: u64,
    /// Bytes received over the link within the trailing stats window.
    pub received_bytes: u64,
    /// Last computed delivery rate (peer-reported received / locally sent).
    pub rate: f64,
}
