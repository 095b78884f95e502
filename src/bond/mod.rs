//! The link-bonding engine.
//!
//! - [`Tallier`]: sliding-window byte counter behind every rate estimate
//! - [`Sampler`]: weighted-random link selector, rebuilt when weights change
//! - [`Mux`]: the adaptive multiplexer tying both to the control gossip

mod mux;
mod sampler;
mod tallier;

pub use mux::{BondConfig, LinkSender, Mux, PacketSink};
pub use sampler::Sampler;
pub use tallier::Tallier;
