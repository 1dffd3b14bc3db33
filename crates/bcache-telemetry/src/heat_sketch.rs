//! Approximate heat tracking: a Count-Min sketch for frequency estimates of
//! arbitrary keys plus a Space-Saving top-k for exact-ish heavy hitters,
//! both decaying exponentially over time. This produces the `HeatRow` feed
//! the planner and admission/eviction read; it is simulation-grade, not a
//! production popularity service.

use std::collections::HashMap;

use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Fixed-size Count-Min sketch: `depth` independent hash rows of `width`
/// counters each; `estimate` returns the minimum across rows, bounding the
/// over-count error that any one row's collisions introduce.
struct CountMinSketch {
    width: usize,
    depth: usize,
    table: Vec<Vec<f64>>,
}

impl CountMinSketch {
    fn new(width: usize, depth: usize) -> Self {
        CountMinSketch {
            width,
            depth,
            table: vec![vec![0.0; width]; depth],
        }
    }

    fn slot(&self, key: &str, row: usize) -> usize {
        (xxh3_64_with_seed(key.as_bytes(), row as u64) % self.width as u64) as usize
    }

    fn add(&mut self, key: &str, weight: f64) {
        for row in 0..self.depth {
            let slot = self.slot(key, row);
            self.table[row][slot] += weight;
        }
    }

    fn estimate(&self, key: &str) -> f64 {
        (0..self.depth)
            .map(|row| self.table[row][self.slot(key, row)])
            .fold(f64::INFINITY, f64::min)
    }

    fn decay(&mut self, factor: f64) {
        for row in &mut self.table {
            for cell in row.iter_mut() {
                *cell *= factor;
            }
        }
    }
}

/// Space-Saving top-k: keeps at most `capacity` distinct keys with counts,
/// evicting (and absorbing the evicted count into) the current minimum when
/// a new key arrives at capacity — the standard approximate heavy-hitter
/// algorithm.
struct SpaceSaving {
    capacity: usize,
    counts: HashMap<String, f64>,
}

impl SpaceSaving {
    fn new(capacity: usize) -> Self {
        SpaceSaving {
            capacity,
            counts: HashMap::new(),
        }
    }

    fn add(&mut self, key: &str, weight: f64) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += weight;
            return;
        }
        if self.counts.len() < self.capacity {
            self.counts.insert(key.to_string(), weight);
            return;
        }
        let min_key = self
            .counts
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(k, _)| k.clone());
        if let Some(min_key) = min_key {
            let min_count = self.counts.remove(&min_key).unwrap_or(0.0);
            self.counts.insert(key.to_string(), min_count + weight);
        }
    }

    fn decay(&mut self, factor: f64) {
        for count in self.counts.values_mut() {
            *count *= factor;
        }
    }

    fn top_k(&self, k: usize) -> Vec<(String, f64)> {
        let mut rows: Vec<(String, f64)> = self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        rows.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        rows.truncate(k);
        rows
    }
}

/// Combined approximate heat tracker with exponential decay, matching the
/// reference popularity service's `decay_lambda` semantics: each call to
/// [`HeatSketch::tick`] multiplies every count by `exp(-decay_lambda * dt)`.
pub struct HeatSketch {
    decay_lambda: f64,
    cms: CountMinSketch,
    top: SpaceSaving,
}

impl HeatSketch {
    pub fn new(decay_lambda: f64) -> Self {
        HeatSketch {
            decay_lambda,
            cms: CountMinSketch::new(2048, 4),
            top: SpaceSaving::new(4096),
        }
    }

    pub fn record(&mut self, key: &str, weight: f64) {
        self.cms.add(key, weight);
        self.top.add(key, weight);
    }

    pub fn estimate(&self, key: &str) -> f64 {
        self.cms.estimate(key)
    }

    pub fn top_k(&self, k: usize) -> Vec<(String, f64)> {
        self.top.top_k(k)
    }

    /// Applies exponential decay for an elapsed duration of `dt_ms`
    /// milliseconds to every tracked count.
    pub fn tick(&mut self, dt_ms: f64) {
        let factor = (-self.decay_lambda * dt_ms).exp();
        self.cms.decay(factor);
        self.top.decay(factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_never_undercounts_true_frequency() {
        let mut sketch = HeatSketch::new(0.01);
        for _ in 0..5 {
            sketch.record("layer0:page7", 1.0);
        }
        assert!(sketch.estimate("layer0:page7") >= 5.0);
    }

    #[test]
    fn top_k_surfaces_the_hottest_key() {
        let mut sketch = HeatSketch::new(0.01);
        for _ in 0..20 {
            sketch.record("hot", 1.0);
        }
        sketch.record("cold", 1.0);
        let top = sketch.top_k(1);
        assert_eq!(top[0].0, "hot");
    }

    #[test]
    fn tick_decays_counts_towards_zero() {
        let mut sketch = HeatSketch::new(0.5);
        sketch.record("k", 100.0);
        let before = sketch.estimate("k");
        sketch.tick(10.0);
        let after = sketch.estimate("k");
        assert!(after < before);
    }
}
