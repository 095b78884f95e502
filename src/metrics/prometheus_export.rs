//! Prometheus-backed observer.

use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
};

use super::BondObserver;
use crate::error::{Error, Result};
use crate::types::LinkId;

/// Collects bonding metrics into a prometheus [`Registry`]. Export (HTTP
/// or otherwise) is up to the embedding process; the registry is exposed
/// through [`PrometheusObserver::registry`].
pub struct PrometheusObserver {
    registry: Registry,
    packets_sent: IntCounterVec,
    link_rate: GaugeVec,
    duplication: Histogram,
}

impl PrometheusObserver {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let packets_sent = IntCounterVec::new(
            Opts::new("packets_sent", "Total number of packets sent"),
            &["link"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let link_rate = GaugeVec::new(
            Opts::new("link_rate", "Estimated delivery rate of link"),
            &["link"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let duplication = Histogram::with_opts(
            HistogramOpts::new("duplication", "Copies sent per packet")
                .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 10.0]),
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        for collector in [
            Box::new(packets_sent.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(link_rate.clone()),
            Box::new(duplication.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            packets_sent,
            link_rate,
            duplication,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl BondObserver for PrometheusObserver {
    fn packet_sent(&self, link: LinkId) {
        self.packets_sent
            .with_label_values(&[&link.to_string()])
            .inc();
    }

    fn link_rate(&self, link: LinkId, rate: f64) {
        self.link_rate
            .with_label_values(&[&link.to_string()])
            .set(rate);
    }

    fn duplication(&self, copies: usize) {
        self.duplication.observe(copies as f64);
    }
}
