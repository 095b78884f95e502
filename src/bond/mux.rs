//! The adaptive multiplexer.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{Sampler, Tallier};
use crate::error::{Error, Result};
use crate::metrics::BondObserver;
use crate::protocol::ControlReport;
use crate::types::{LinkId, LinkSnapshot};

/// Delivers reassembled payloads upward to the virtual network device.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Transmits a framed data packet on one specific link.
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn send(&self, link: LinkId, payload: &[u8]) -> Result<()>;
}

/// Multiplexer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondConfig {
    /// Exponent applied to the clamped delivery rate when deriving a
    /// sampling weight. Higher values bias harder toward healthy links
    /// while keeping unhealthy ones drawable at low probability.
    #[serde(default = "default_weight_exponent")]
    pub weight_exponent: f64,

    /// Cumulative-rate cutoff for redundant sends: links are drawn until
    /// their summed delivery rates exceed this, so an untrusted link set
    /// gets the same packet over several links.
    #[serde(default = "default_redundancy_threshold")]
    pub redundancy_threshold: f64,

    /// Bound on sampler draws per packet, so degenerate weights cannot
    /// loop forever.
    #[serde(default = "default_max_draws")]
    pub max_draws: usize,

    /// Bucket width of the per-link byte counters.
    #[serde(default = "default_stat_bucket", with = "humantime_serde")]
    pub stat_bucket: Duration,

    /// Window length of the per-link byte counters.
    #[serde(default = "default_stat_window", with = "humantime_serde")]
    pub stat_window: Duration,
}

fn default_weight_exponent() -> f64 {
    2.0
}
fn default_redundancy_threshold() -> f64 {
    0.95
}
fn default_max_draws() -> usize {
    10
}
fn default_stat_bucket() -> Duration {
    Duration::from_millis(500)
}
fn default_stat_window() -> Duration {
    Duration::from_secs(30)
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            weight_exponent: default_weight_exponent(),
            redundancy_threshold: default_redundancy_threshold(),
            max_draws: default_max_draws(),
            stat_bucket: default_stat_bucket(),
            stat_window: default_stat_window(),
        }
    }
}

/// Per-link statistics. The talliers are only written by the one read-loop
/// worker owning the link's receives and by the single send path; the rate
/// is recomputed wholesale on every accepted control report.
struct LinkStats {
    sent: Tallier,
    received: Tallier,
    rate: RwLock<f64>,
}

impl LinkStats {
    fn new(config: &BondConfig) -> Self {
        Self {
            sent: Tallier::new(config.stat_bucket, config.stat_window),
            received: Tallier::new(config.stat_bucket, config.stat_window),
            rate: RwLock::new(0.0),
        }
    }
}

/// The adaptive core: tracks per-link health from gossiped control
/// reports and decides which link(s) carry each outgoing packet.
pub struct Mux {
    config: BondConfig,
    links: DashMap<LinkId, LinkStats>,
    /// Replaced wholesale whenever a fresh control report is processed;
    /// never partially mutated.
    sampler: RwLock<Option<Sampler>>,
    our_seq: AtomicU64,
    peer_seq: Mutex<Option<u64>>,
    sink: OnceLock<Arc<dyn PacketSink>>,
    sender: OnceLock<Arc<dyn LinkSender>>,
    observer: Arc<dyn BondObserver>,
}

impl Mux {
    pub fn new(config: BondConfig, observer: Arc<dyn BondObserver>) -> Self {
        Self {
            config,
            links: DashMap::new(),
            sampler: RwLock::new(None),
            our_seq: AtomicU64::new(0),
            peer_seq: Mutex::new(None),
            sink: OnceLock::new(),
            sender: OnceLock::new(),
            observer,
        }
    }

    /// Wire up the collaborators. Must be called once before any traffic
    /// flows; the link registry needs the mux at construction time, so the
    /// reverse references arrive late through here.
    pub fn bind(&self, sink: Arc<dyn PacketSink>, sender: Arc<dyn LinkSender>) {
        let _ = self.sink.set(sink);
        let _ = self.sender.set(sender);
    }

    /// Allocate fresh statistics for a new link id. Callers register each
    /// id exactly once.
    pub fn add_link(&self, id: LinkId) {
        self.links.insert(id, LinkStats::new(&self.config));
    }

    /// Send one packet over the currently selected link set. Succeeds if
    /// at least one link accepted the write.
    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        let ids = self.select_links();
        if ids.is_empty() {
            return Err(Error::NoLinksAvailable);
        }
        self.observer.duplication(ids.len());

        let sender = self
            .sender
            .get()
            .ok_or_else(|| Error::Internal("mux used before bind".into()))?;

        let mut delivered = false;
        let mut last_err = None;
        for id in ids {
            match sender.send(id, packet).await {
                Ok(()) => {
                    delivered = true;
                    if let Some(stats) = self.links.get(&id) {
                        stats.sent.tally(packet.len() as u64);
                    }
                    self.observer.packet_sent(id);
                }
                Err(e) => {
                    debug!(link = %id, error = %e, "send failed on link");
                    last_err = Some(e);
                }
            }
        }

        if delivered {
            Ok(())
        } else {
            Err(last_err.unwrap_or(Error::NoLinksAvailable))
        }
    }

    /// Account an inbound data packet and hand it to the device.
    pub async fn received(&self, link: LinkId, packet: &[u8]) -> Result<()> {
        if let Some(stats) = self.links.get(&link) {
            stats.received.tally(packet.len() as u64);
        }
        let sink = self
            .sink
            .get()
            .ok_or_else(|| Error::Internal("mux used before bind".into()))?;
        sink.send(packet).await?;
        Ok(())
    }

    /// Consume a peer control report: refresh per-link delivery rates and
    /// swap in a sampler built from the new weights. Stale, duplicate and
    /// undecodable reports are dropped.
    pub fn handle_control(&self, from: LinkId, raw: &[u8]) {
        let report = match ControlReport::decode(raw) {
            Ok(report) => report,
            Err(e) => {
                warn!(link = %from, error = %e, "dropping undecodable control report");
                return;
            }
        };

        {
            let mut last = self.peer_seq.lock();
            if let Some(prev) = *last {
                if !seq_newer(report.seq, prev) {
                    trace!(seq = report.seq, last = prev, "dropping stale control report");
                    return;
                }
            }
            *last = Some(report.seq);
        }

        let mut weights = HashMap::with_capacity(report.received.len());
        for (&wire_id, &received) in &report.received {
            let id = LinkId(wire_id);
            let Some(stats) = self.links.get(&id) else {
                // The peer can know links we have not learned yet: on the
                // listening side a link only materializes with its first
                // data packet, while the peer reports everything it dialed.
                continue;
            };
            let sent = stats.sent.count() as f64;
            let rate = if received == 0 {
                if sent == 0.0 {
                    // Untested link: nothing sent, nothing lost.
                    1.0
                } else {
                    0.0
                }
            } else {
                received as f64 / sent
            };
            *stats.rate.write() = rate;
            self.observer.link_rate(id, rate);
            weights.insert(id, rate.min(1.0).powf(self.config.weight_exponent));
        }

        *self.sampler.write() = Some(Sampler::new(&weights));
    }

    /// Build the next outgoing control report.
    pub fn craft_control(&self) -> Result<Vec<u8>> {
        let seq = self.our_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let received = self
            .links
            .iter()
            .map(|entry| (entry.key().0, entry.value().received.count()))
            .collect();
        ControlReport { seq, received }.encode()
    }

    /// Pick the link set for one outgoing packet.
    ///
    /// Before the first control round there are no rates to go by, so any
    /// one known link keeps the channel usable. Afterwards, links are drawn
    /// from the sampler until the accumulated delivery rate clears the
    /// redundancy threshold or the draw budget runs out.
    fn select_links(&self) -> Vec<LinkId> {
        let sampler = self.sampler.read();
        let usable = sampler.as_ref().filter(|s| !s.is_empty());
        let Some(sampler) = usable else {
            return self
                .links
                .iter()
                .next()
                .map(|entry| vec![*entry.key()])
                .unwrap_or_default();
        };

        let mut picked = Vec::new();
        let mut cumulative = 0.0;
        for _ in 0..self.config.max_draws {
            let id = sampler.sample();
            if picked.contains(&id) {
                continue;
            }
            picked.push(id);
            if let Some(stats) = self.links.get(&id) {
                cumulative += *stats.rate.read();
            }
            if cumulative > self.config.redundancy_threshold {
                break;
            }
        }
        picked
    }

    /// Current statistics for every known link, ordered by id.
    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut out: Vec<_> = self
            .links
            .iter()
            .map(|entry| LinkSnapshot {
                id: *entry.key(),
                sent_bytes: entry.value().sent.count(),
                received_bytes: entry.value().received.count(),
                rate: *entry.value().rate.read(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }
}

/// Strictly-newer comparison with wraparound: `seq` is fresh iff it is
/// ahead of `last` by at most half the sequence space. A merely *different*
/// sequence number is not enough; a repeated or regressed one is stale.
fn seq_newer(seq: u64, last: u64) -> bool {
    let delta = seq.wrapping_sub(last);
    delta != 0 && delta <= u64::MAX / 2
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("links", &self.links.len())
            .field("has_sampler", &self.sampler.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopObserver;
    use std::collections::BTreeMap;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(LinkId, Vec<u8>)>>,
        failing: HashSet<LinkId>,
    }

    #[async_trait]
    impl LinkSender for RecordingSender {
        async fn send(&self, link: LinkId, payload: &[u8]) -> Result<()> {
            if self.failing.contains(&link) {
                return Err(Error::Transport(
                    crate::error::TransportError::SendFailed("stub failure".into()),
                ));
            }
            self.sent.lock().push((link, payload.to_vec()));
            Ok(())
        }
    }

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

    fn mux_with_stubs() -> (Arc<Mux>, Arc<RecordingSender>, Arc<RecordingSink>) {
        let mux = Arc::new(Mux::new(BondConfig::default(), Arc::new(NoopObserver)));
        let sender = Arc::new(RecordingSender::default());
        let sink = Arc::new(RecordingSink::default());
        mux.bind(sink.clone(), sender.clone());
        (mux, sender, sink)
    }

    fn report(seq: u64, received: &[(u16, u64)]) -> Vec<u8> {
        ControlReport {
            seq,
            received: BTreeMap::from_iter(received.iter().copied()),
        }
        .encode()
        .unwrap()
    }

    #[tokio::test]
    async fn send_without_links_fails() {
        let (mux, _, _) = mux_with_stubs();
        assert!(matches!(
            mux.send(b"packet").await,
            Err(Error::NoLinksAvailable)
        ));
    }

    #[tokio::test]
    async fn falls_back_to_any_link_before_first_control_round() {
        let (mux, sender, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.send(b"hello").await.unwrap();
        let sent = sender.sent.lock();
        assert_eq!(sent.as_slice(), &[(LinkId(1), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn send_tallies_bytes_per_link() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.send(&[0u8; 100]).await.unwrap();
        mux.send(&[0u8; 50]).await.unwrap();
        let snapshot = mux.snapshot();
        assert_eq!(snapshot[0].sent_bytes, 150);
    }

    #[tokio::test]
    async fn received_forwards_to_sink_and_tallies() {
        let (mux, _, sink) = mux_with_stubs();
        mux.add_link(LinkId(3));
        mux.received(LinkId(3), b"payload").await.unwrap();
        assert_eq!(sink.packets.lock().as_slice(), &[b"payload".to_vec()]);
        assert_eq!(mux.snapshot()[0].received_bytes, 7);
    }

    #[tokio::test]
    async fn send_survives_a_failing_link() {
        // A draw budget large enough that both half-trusted links are
        // always selected together.
        let config = BondConfig {
            max_draws: 200,
            ..BondConfig::default()
        };
        let mux = Arc::new(Mux::new(config, Arc::new(NoopObserver)));
        let sender = Arc::new(RecordingSender {
            failing: HashSet::from([LinkId(1)]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        mux.bind(sink, sender.clone());
        mux.add_link(LinkId(1));
        mux.add_link(LinkId(2));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.links.get(&LinkId(2)).unwrap().sent.tally(100);
        mux.handle_control(LinkId(1), &report(1, &[(1, 50), (2, 50)]));

        // Link 1 always fails, link 2 always accepts: the send as a whole
        // must still succeed, and only link 2 accumulates packets.
        for _ in 0..20 {
            mux.send(b"x").await.unwrap();
        }
        assert!(!sender.sent.lock().is_empty());
        assert!(sender.sent.lock().iter().all(|(id, _)| *id == LinkId(2)));
    }

    #[test]
    fn control_updates_rates() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.add_link(LinkId(2));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.links.get(&LinkId(2)).unwrap().sent.tally(100);
        mux.handle_control(LinkId(1), &report(1, &[(1, 100), (2, 0)]));

        let snapshot = mux.snapshot();
        assert_eq!(snapshot[0].rate, 1.0);
        assert_eq!(snapshot[1].rate, 0.0);
    }

    #[test]
    fn untested_link_is_assumed_perfect() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        // Nothing sent, nothing reported received.
        mux.handle_control(LinkId(1), &report(1, &[(1, 0)]));
        assert_eq!(mux.snapshot()[0].rate, 1.0);
    }

    #[test]
    fn duplicate_control_report_is_ignored() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.handle_control(LinkId(1), &report(7, &[(1, 100)]));
        assert_eq!(mux.snapshot()[0].rate, 1.0);

        // Same sequence number, wildly different contents: must not apply.
        mux.handle_control(LinkId(1), &report(7, &[(1, 0)]));
        assert_eq!(mux.snapshot()[0].rate, 1.0);
    }

    #[test]
    fn regressed_control_report_is_ignored() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.handle_control(LinkId(1), &report(9, &[(1, 100)]));
        mux.handle_control(LinkId(1), &report(3, &[(1, 0)]));
        assert_eq!(mux.snapshot()[0].rate, 1.0);
    }

    #[test]
    fn sequence_wraparound_is_accepted() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.handle_control(LinkId(1), &report(u64::MAX, &[(1, 0)]));
        assert_eq!(mux.snapshot()[0].rate, 0.0);
        // Wraps past zero: still strictly newer.
        mux.handle_control(LinkId(1), &report(1, &[(1, 100)]));
        assert_eq!(mux.snapshot()[0].rate, 1.0);
    }

    #[test]
    fn unknown_links_in_report_are_skipped() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.handle_control(LinkId(1), &report(1, &[(1, 0), (42, 9999)]));
        assert_eq!(mux.snapshot().len(), 1);
    }

    #[test]
    fn undecodable_control_report_is_dropped() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.handle_control(LinkId(1), &[0xde, 0xad]);
        assert_eq!(mux.snapshot()[0].rate, 0.0);
    }

    #[test]
    fn healthy_link_outranks_dead_link_in_selection() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.add_link(LinkId(2));
        mux.links.get(&LinkId(1)).unwrap().sent.tally(100);
        mux.links.get(&LinkId(2)).unwrap().sent.tally(100);
        // Link 1 delivered everything, link 2 nothing.
        mux.handle_control(LinkId(1), &report(1, &[(1, 100), (2, 0)]));

        // Link 1 alone clears the redundancy threshold, and link 2 has
        // zero weight: the selection must always be exactly [1].
        for _ in 0..200 {
            assert_eq!(mux.select_links(), vec![LinkId(1)]);
        }
    }

    #[test]
    fn distrusted_links_are_sent_redundantly() {
        let (mux, _, _) = mux_with_stubs();
        for id in 1..=10u16 {
            mux.add_link(LinkId(id));
            mux.links.get(&LinkId(id)).unwrap().sent.tally(100);
        }
        // Every link drops most traffic: no single link clears the
        // threshold, so selections should span several links.
        let reported: Vec<(u16, u64)> = (1..=10).map(|id| (id, 10)).collect();
        mux.handle_control(LinkId(1), &report(1, &reported));

        let picked = mux.select_links();
        assert!(picked.len() >= 2, "expected redundant send, got {picked:?}");
        assert!(picked.len() <= mux.config.max_draws);
        let distinct: HashSet<_> = picked.iter().collect();
        assert_eq!(distinct.len(), picked.len(), "duplicate ids in {picked:?}");
    }

    #[test]
    fn craft_control_reports_received_bytes_and_increments_seq() {
        let (mux, _, _) = mux_with_stubs();
        mux.add_link(LinkId(1));
        mux.links.get(&LinkId(1)).unwrap().received.tally(321);

        let first = ControlReport::decode(&mux.craft_control().unwrap()).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.received, BTreeMap::from([(1, 321)]));

        let second = ControlReport::decode(&mux.craft_control().unwrap()).unwrap();
        assert_eq!(second.seq, 2);
    }

    #[test]
    fn seq_newer_semantics() {
        assert!(seq_newer(2, 1));
        assert!(!seq_newer(1, 1));
        assert!(!seq_newer(1, 2));
        assert!(seq_newer(0, u64::MAX));
        assert!(!seq_newer(u64::MAX, 0));
    }
}
