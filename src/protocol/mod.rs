//! Wire protocol: the per-datagram frame and the gossiped control report.
//!
//! Every UDP datagram exchanged between two peers is one frame: a four-byte
//! header (`'B' 'L' type link-id`) followed by an opaque payload. Data
//! frames carry IP packets from the device; control frames carry a
//! serialized [`ControlReport`].

mod control;
mod frame;

pub use control::ControlReport;
pub use frame::{encode, FrameType, FrameView, FRAME_HEADER_LEN, FRAME_MAGIC};
