//! Observability capability for the bonding engine.
//!
//! The multiplexer reports what it does through an injected
//! [`BondObserver`] rather than ambient global state; embedding processes
//! decide what to do with the numbers. With the `metrics` feature enabled,
//! [`PrometheusObserver`] collects them into a prometheus registry the
//! process can export however it likes.

#[cfg(feature = "metrics")]
mod prometheus_export;

#[cfg(feature = "metrics")]
pub use prometheus_export::PrometheusObserver;

use serde::{Deserialize, Serialize};

use crate::types::LinkId;

/// Metrics configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Collect prometheus metrics (requires the `metrics` build feature).
    #[serde(default)]
    pub enabled: bool,
}

/// Receives bonding-engine events. Implementations must be cheap; these
/// are called on the packet hot path.
pub trait BondObserver: Send + Sync {
    /// One copy of a packet was accepted by `link`.
    fn packet_sent(&self, link: LinkId) {
        let _ = link;
    }

    /// `link`'s delivery rate was recomputed from a control report.
    fn link_rate(&self, link: LinkId, rate: f64) {
        let _ = (link, rate);
    }

    /// One outgoing packet was sent over `copies` links.
    fn duplication(&self, copies: usize) {
        let _ = copies;
    }
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl BondObserver for NoopObserver {}
