//! Sliding-window event counter.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Counts how much happened within the trailing window, using a ring of
/// fixed-width time buckets. A bucket whose recorded time slot has aged out
/// of the window contributes nothing and is only reset lazily on the next
/// write to its ring position, so there is no background sweep.
///
/// One instance is shared between the read-loop worker that tallies
/// receives and the send path that queries rates, so the ring lives behind
/// a mutex; the lazy reset is not safe under unsynchronized writers.
#[derive(Debug)]
pub struct Tallier {
    bucket_ms: u64,
    window_ms: u64,
    origin: Instant,
    buckets: Mutex<Vec<Bucket>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Absolute slot index this bucket last represented.
    slot: u64,
    count: u64,
}

impl Tallier {
    /// Bucket width and window length; the window must hold at least one
    /// bucket. 500 ms buckets over 30 s favor smoothing; 100 ms over 5 s
    /// favor responsiveness.
    pub fn new(bucket: Duration, window: Duration) -> Self {
        let bucket_ms = bucket.as_millis().max(1) as u64;
        let window_ms = window.as_millis() as u64;
        let n_buckets = (window_ms / bucket_ms).max(1) as usize;
        Self {
            bucket_ms,
            window_ms,
            origin: Instant::now(),
            buckets: Mutex::new(vec![Bucket::default(); n_buckets]),
        }
    }

    /// Record `n` units as having occurred now.
    pub fn tally(&self, n: u64) {
        let slot = self.elapsed_ms() / self.bucket_ms;
        let mut buckets = self.buckets.lock();
        let len = buckets.len() as u64;
        let bucket = &mut buckets[(slot % len) as usize];
        if bucket.slot != slot {
            bucket.slot = slot;
            bucket.count = 0;
        }
        bucket.count += n;
    }

    /// Total recorded within the trailing window.
    pub fn count(&self) -> u64 {
        let oldest = self.elapsed_ms().saturating_sub(self.window_ms) / self.bucket_ms;
        self.buckets
            .lock()
            .iter()
            .filter(|b| b.slot >= oldest)
            .map(|b| b.count)
            .sum()
    }

    fn elapsed_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_recent_tallies() {
        let t = Tallier::new(Duration::from_millis(10), Duration::from_millis(200));
        t.tally(3);
        t.tally(2);
        t.tally(0);
        assert_eq!(t.count(), 5);
    }

    #[test]
    fn decays_to_zero_after_the_window() {
        let t = Tallier::new(Duration::from_millis(10), Duration::from_millis(50));
        t.tally(7);
        assert_eq!(t.count(), 7);
        // One window plus one bucket with no further tallies.
        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn stale_bucket_is_reset_on_reuse() {
        // Three buckets: after sleeping past the window, the next tally
        // lands on a ring slot still holding stale data, which must be
        // discarded rather than added to.
        let t = Tallier::new(Duration::from_millis(10), Duration::from_millis(30));
        t.tally(100);
        std::thread::sleep(Duration::from_millis(45));
        t.tally(1);
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn shared_between_threads() {
        let t = std::sync::Arc::new(Tallier::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = std::sync::Arc::clone(&t);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        t.tally(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(t.count(), 4000);
    }
}
