// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Online quantile estimation.
//!
//! A Greenwald-Khanna sketch: epsilon-approximate quantiles over a stream
//! without keeping the stream. With the default epsilon of 0.01 a reported
//! quantile's rank is within 1% of the stream length of the true rank. The
//! estimator is deterministic, which the sampler relies on for stable
//! keep/drop decisions.

/// Default accuracy for sketches across the agent.
pub const DEFAULT_EPSILON: f64 = 0.01;

#[derive(Clone, Debug)]
struct Tuple {
    value: f64,
    /// Gap between this tuple's minimum rank and the previous tuple's.
    g: u64,
    /// Rank uncertainty of this tuple.
    delta: u64,
}

#[derive(Clone, Debug)]
pub struct QuantileSketch {
    epsilon: f64,
    n: u64,
    /// Ascending by value.
    tuples: Vec<Tuple>,
    /// Inserts between compressions, 1 / (2 * epsilon).
    compress_every: u64,
}

impl QuantileSketch {
    pub fn new(epsilon: f64) -> Self {
        let epsilon = if epsilon > 0.0 { epsilon } else { DEFAULT_EPSILON };
        QuantileSketch {
            epsilon,
            n: 0,
            tuples: Vec::new(),
            compress_every: (1.0 / (2.0 * epsilon)).ceil() as u64,
        }
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let pos = self.tuples.partition_point(|t| t.value < value);
        let delta = if pos == 0 || pos == self.tuples.len() {
            0
        } else {
            (2.0 * self.epsilon * self.n as f64).floor() as u64
        };
        self.tuples.insert(
            pos,
            Tuple {
                value,
                g: 1,
                delta,
            },
        );
        self.n += 1;
        if self.n % self.compress_every == 0 {
            self.compress();
        }
    }

    /// Estimated value at quantile `q` in `[0, 1]`; 0 for an empty sketch.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.tuples.is_empty() {
            return 0.0;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = (q * self.n as f64).ceil() as u64;
        let margin = (self.epsilon * self.n as f64).ceil() as u64;

        let mut rmin = 0;
        let mut prev = self.tuples[0].value;
        for tuple in &self.tuples {
            rmin += tuple.g;
            if rmin + tuple.delta > rank + margin {
                return prev;
            }
            prev = tuple.value;
        }
        prev
    }

    /// Merges adjacent tuples whose combined rank uncertainty stays within
    /// the 2-epsilon-n budget.
    fn compress(&mut self) {
        if self.tuples.len() < 3 {
            return;
        }
        let budget = (2.0 * self.epsilon * self.n as f64).floor() as u64;
        let mut i = self.tuples.len() - 2;
        // never merge into the first or last tuple, they anchor the extremes
        while i >= 1 {
            let merged_g = self.tuples[i].g + self.tuples[i + 1].g;
            if i + 1 < self.tuples.len() - 1 && merged_g + self.tuples[i + 1].delta <= budget {
                self.tuples[i + 1].g = merged_g;
                self.tuples.remove(i);
            }
            i -= 1;
        }
    }
}

impl Default for QuantileSketch {
    fn default() -> Self {
        QuantileSketch::new(DEFAULT_EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sketch() {
        let sketch = QuantileSketch::default();
        assert!(sketch.is_empty());
        assert_eq!(sketch.quantile(0.5), 0.0);
    }

    #[test]
    fn test_single_value() {
        let mut sketch = QuantileSketch::default();
        sketch.insert(42.0);
        assert_eq!(sketch.quantile(0.0), 42.0);
        assert_eq!(sketch.quantile(0.5), 42.0);
        assert_eq!(sketch.quantile(1.0), 42.0);
    }

    #[test]
    fn test_uniform_stream_within_epsilon() {
        let mut sketch = QuantileSketch::default();
        for v in 1..=10_000 {
            sketch.insert(v as f64);
        }
        // epsilon = 0.01 over 10k points: rank error at most ~100, allow 2x.
        for (q, expected) in [(0.5, 5_000.0), (0.95, 9_500.0), (0.99, 9_900.0)] {
            let got = sketch.quantile(q);
            assert!(
                (got - expected).abs() <= 200.0,
                "q{q}: got {got}, expected ~{expected}"
            );
        }
    }

    #[test]
    fn test_descending_insertion_order_irrelevant_to_accuracy() {
        let mut sketch = QuantileSketch::default();
        for v in (1..=1_000).rev() {
            sketch.insert(v as f64);
        }
        let got = sketch.quantile(0.95);
        assert!((got - 950.0).abs() <= 20.0, "got {got}");
    }

    #[test]
    fn test_compression_bounds_memory() {
        let mut sketch = QuantileSketch::default();
        for v in 0..100_000 {
            sketch.insert((v % 977) as f64);
        }
        // without compression this would hold 100k tuples
        assert!(sketch.tuples.len() < 2_000, "len {}", sketch.tuples.len());
    }

    #[test]
    fn test_quantiles_monotone() {
        let mut sketch = QuantileSketch::default();
        for v in 1..=5_000 {
            sketch.insert((v * 7 % 5_000) as f64);
        }
        let mut last = f64::MIN;
        for i in 0..=20 {
            let q = sketch.quantile(i as f64 / 20.0);
            assert!(q >= last);
            last = q;
        }
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut sketch = QuantileSketch::default();
        sketch.insert(f64::NAN);
        sketch.insert(f64::INFINITY);
        assert!(sketch.is_empty());
    }
}
