//! # Linkweave
//!
//! Bonds several independent, individually unreliable point-to-point links
//! (direct UDP sockets, or UDP relayed through a SOCKS5 proxy) into a single
//! logical packet channel for a virtual network interface.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TUN device (IP packets)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │   Mux — adaptive multiplexer: per-link delivery rates,      │
//! │   weighted link sampling, controlled duplication            │
//! ├─────────────────────────────────────────────────────────────┤
//! │   LinkMap — link registry, wire framing, read loops,        │
//! │   periodic control gossip                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌───────────┐  ┌────────────────────────┐   │
//! │  │ UDP link  │  │ UDP link  │  │ UDP-over-SOCKS5 link   │   │
//! │  └───────────┘  └───────────┘  └────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Each outgoing packet is sent over whichever subset of links currently
//! delivers best. Both peers gossip the byte counts they observed per link;
//! from `received / sent` each side derives a delivery rate per link and
//! rebuilds a weighted sampler from it. When no single link is trusted to
//! deliver reliably, the same packet is intentionally sent over several
//! links, trading bandwidth for loss resilience. Delivery is best-effort:
//! the upper layer must tolerate reordering and duplication.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // byte counts into f64 rates
#![allow(clippy::missing_errors_doc)]

pub mod bond;
pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod tun;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::LinkId;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest datagram we ever read off a socket. Generously above any sane
/// tunnel MTU plus framing overhead.
pub const MAX_DATAGRAM: usize = 8192;
