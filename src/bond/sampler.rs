//! Weighted-random link selection.

use std::collections::HashMap;

use rand::Rng;

use crate::types::LinkId;

/// Draws link ids with probability proportional to their weight.
///
/// A sampler is immutable once built; when weights change the caller
/// builds a fresh one and swaps it in wholesale. Zero-weight links are
/// never drawn. Construction from an empty map is legal but such a
/// sampler must not be asked to sample — check [`Sampler::is_empty`]
/// first.
#[derive(Debug)]
pub struct Sampler {
    sum: f64,
    /// Cumulative weight bounds, parallel to `ids`.
    offsets: Vec<f64>,
    ids: Vec<LinkId>,
}

impl Sampler {
    pub fn new(weights: &HashMap<LinkId, f64>) -> Self {
        let mut ids = Vec::with_capacity(weights.len());
        let mut offsets = Vec::with_capacity(weights.len());
        let mut sum = 0.0;
        for (&id, &weight) in weights {
            sum += weight;
            ids.push(id);
            offsets.push(sum);
        }
        Self { sum, offsets, ids }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Draw one link id. With at most 255 links a linear scan over the
    /// cumulative bounds beats the bookkeeping of anything cleverer.
    ///
    /// # Panics
    ///
    /// Panics if the sampler is empty.
    pub fn sample(&self) -> LinkId {
        let draw = rand::thread_rng().gen::<f64>() * self.sum;
        for (i, &offset) in self.offsets.iter().enumerate() {
            if offset > draw {
                return self.ids[i];
            }
        }
        // All weights zero (sum == 0): no bound can exceed the draw.
        self.ids[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequencies_converge_to_weights() {
        let weights = HashMap::from([(LinkId(1), 3.0), (LinkId(2), 1.0)]);
        let sampler = Sampler::new(&weights);
        let draws = 40_000;
        let ones = (0..draws)
            .filter(|_| sampler.sample() == LinkId(1))
            .count();
        let fraction = ones as f64 / draws as f64;
        assert!(
            (fraction - 0.75).abs() < 0.02,
            "expected ~0.75, got {fraction}"
        );
    }

    #[test]
    fn zero_weight_links_are_never_drawn() {
        let weights = HashMap::from([
            (LinkId(1), 0.0),
            (LinkId(2), 1.0),
            (LinkId(3), 0.0),
        ]);
        let sampler = Sampler::new(&weights);
        for _ in 0..2000 {
            assert_eq!(sampler.sample(), LinkId(2));
        }
    }

    #[test]
    fn single_link_is_always_drawn() {
        let sampler = Sampler::new(&HashMap::from([(LinkId(9), 0.25)]));
        for _ in 0..100 {
            assert_eq!(sampler.sample(), LinkId(9));
        }
    }

    #[test]
    fn empty_sampler_is_detectable() {
        assert!(Sampler::new(&HashMap::new()).is_empty());
        assert!(!Sampler::new(&HashMap::from([(LinkId(1), 1.0)])).is_empty());
    }

    #[test]
    fn all_zero_weights_still_return_some_link() {
        let sampler = Sampler::new(&HashMap::from([(LinkId(1), 0.0), (LinkId(2), 0.0)]));
        let id = sampler.sample();
        assert!(id == LinkId(1) || id == LinkId(2));
    }
}
