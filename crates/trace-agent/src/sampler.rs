// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace sampling keyed on per-resource duration quantiles.
//!
//! Each `(service, resource)` signature keeps a rolling quantile sketch of
//! root durations. A trace is kept when its score beats the signature's
//! p95 (slow outliers), when the signature is new (rare resources), or
//! with a small floor probability so common traces are never fully
//! starved. `extra_sample_rate` applies as a final multiplicative keep
//! probability, and a token bucket caps the output rate.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::config::Config;
use crate::sketch::QuantileSketch;
use crate::trace::{ProcessedTrace, Trace};

/// Quantile a trace's score must beat to be kept outright.
const KEEP_QUANTILE: f64 = 0.95;
/// Keep probability for traces below the quantile.
const FLOOR_PROBABILITY: f64 = 0.05;
/// Signature windows are rebuilt after this long, so old traffic shapes
/// age out of the quantile estimates.
const SIGNATURE_WINDOW: Duration = Duration::from_secs(300);
/// Token-bucket burst headroom over the sustained rate.
const BURST_FACTOR: f64 = 2.0;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SignatureKey {
    service: String,
    resource: String,
}

struct SignatureWindow {
    sketch: QuantileSketch,
    opened_at: Instant,
}

impl SignatureWindow {
    fn new(now: Instant) -> Self {
        SignatureWindow {
            sketch: QuantileSketch::default(),
            opened_at: now,
        }
    }
}

/// Classic token bucket; a rate of 0 disables limiting.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, now: Instant) -> Self {
        let capacity = (rate * BURST_FACTOR).max(1.0);
        TokenBucket {
            rate,
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn allow(&mut self, now: Instant) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct SamplerState {
    windows: HashMap<SignatureKey, SignatureWindow>,
    staged: Vec<Trace>,
    limiter: TokenBucket,
}

pub struct ResourceQuantileSampler {
    state: Mutex<SamplerState>,
    extra_sample_rate: f64,
}

impl ResourceQuantileSampler {
    pub fn new(config: &Config) -> Self {
        ResourceQuantileSampler {
            state: Mutex::new(SamplerState {
                windows: HashMap::new(),
                staged: Vec::new(),
                limiter: TokenBucket::new(config.max_traces_per_second, Instant::now()),
            }),
            extra_sample_rate: config.extra_sample_rate,
        }
    }

    /// Scores the trace against its signature window and stages it when kept.
    pub fn add(&self, pt: &ProcessedTrace) {
        self.add_at(pt, Instant::now());
    }

    fn add_at(&self, pt: &ProcessedTrace, now: Instant) {
        let root = pt.root_span();
        let score = root.duration as f64;
        let key = SignatureKey {
            service: root.service.clone(),
            resource: root.resource.clone(),
        };

        let mut state = self.lock_state();

        let window = state
            .windows
            .entry(key)
            .or_insert_with(|| SignatureWindow::new(now));
        if now.saturating_duration_since(window.opened_at) > SIGNATURE_WINDOW {
            *window = SignatureWindow::new(now);
        }

        let keep = if window.sketch.is_empty() {
            // first sighting of this signature in the window
            true
        } else {
            let threshold = window.sketch.quantile(KEEP_QUANTILE);
            if score > threshold {
                true
            } else if score == threshold {
                // stable tie-break so repeated runs agree
                root.trace_id % 2 == 0
            } else {
                rand::thread_rng().gen::<f64>() < FLOOR_PROBABILITY
            }
        };
        window.sketch.insert(score);

        let keep = keep
            && (self.extra_sample_rate >= 1.0
                || rand::thread_rng().gen::<f64>() < self.extra_sample_rate);
        let keep = keep && state.limiter.allow(now);

        if keep {
            state.staged.push(pt.trace.clone());
        } else {
            debug!(trace_id = root.trace_id, "sampling out trace");
        }
    }

    /// Atomically swaps out and returns the staged traces.
    pub fn flush(&self) -> Vec<Trace> {
        let mut state = self.lock_state();
        // drop signatures that stopped producing traffic
        let now = Instant::now();
        state
            .windows
            .retain(|_, w| now.saturating_duration_since(w.opened_at) <= 2 * SIGNATURE_WINDOW);
        std::mem::take(&mut state.staged)
    }

    fn lock_state(&self) -> MutexGuard<'_, SamplerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Span;

    fn config(max_tps: f64, extra_rate: f64) -> Config {
        Config {
            max_traces_per_second: max_tps,
            extra_sample_rate: extra_rate,
            ..Config::default()
        }
    }

    fn processed(trace_id: u64, resource: &str, duration: i64) -> ProcessedTrace {
        ProcessedTrace {
            trace: vec![Span {
                trace_id,
                span_id: 1,
                service: "svc".to_string(),
                name: "op".to_string(),
                resource: resource.to_string(),
                duration,
                ..Span::default()
            }],
            root: 0,
            env: "test".to_string(),
            sublayers: Vec::new(),
        }
    }

    #[test]
    fn test_new_signature_always_kept() {
        let sampler = ResourceQuantileSampler::new(&config(0.0, 1.0));
        sampler.add(&processed(1, "/rare", 100));
        assert_eq!(sampler.flush().len(), 1);
    }

    #[test]
    fn test_slow_outlier_kept() {
        let sampler = ResourceQuantileSampler::new(&config(0.0, 1.0));
        for i in 0..200 {
            sampler.add(&processed(i, "/common", 100));
        }
        sampler.flush();

        sampler.add(&processed(9_999, "/common", 1_000_000));
        let kept = sampler.flush();
        assert!(kept.iter().any(|t| t[0].trace_id == 9_999));
    }

    #[test]
    fn test_zero_extra_sample_rate_drops_everything_after_floor() {
        let sampler = ResourceQuantileSampler::new(&config(0.0, 0.0));
        for i in 0..100 {
            sampler.add(&processed(i + 1, "/r", 100));
        }
        assert!(sampler.flush().is_empty());
    }

    #[test]
    fn test_flush_swaps_staged_buffer() {
        let sampler = ResourceQuantileSampler::new(&config(0.0, 1.0));
        sampler.add(&processed(1, "/a", 100));
        assert_eq!(sampler.flush().len(), 1);
        assert!(sampler.flush().is_empty());
    }

    #[test]
    fn test_token_bucket_caps_sustained_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(5.0, start);

        // 5 tps over a simulated 200 seconds, offered 20 tps
        let mut allowed = 0;
        for tick in 0..4_000 {
            let now = start + Duration::from_millis(tick * 50);
            if bucket.allow(now) {
                allowed += 1;
            }
        }
        let rate = allowed as f64 / 200.0;
        assert!(rate <= 5.1, "sustained rate {rate} exceeds cap");
        // and the cap should actually be reachable
        assert!(rate > 4.5, "sustained rate {rate} far below cap");
    }

    #[test]
    fn test_token_bucket_disabled_at_zero() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(0.0, start);
        for _ in 0..1_000 {
            assert!(bucket.allow(start));
        }
    }

    #[test]
    fn test_rate_cap_applies_to_kept_traces() {
        // rate 1 tps, no elapsed time: burst capacity (2 tokens) is the most
        // that can come out regardless of how interesting the traces are.
        let sampler = ResourceQuantileSampler::new(&config(1.0, 1.0));
        let now = Instant::now();
        for i in 0..50 {
            sampler.add_at(&processed(i + 1, &format!("/r{i}"), 100), now);
        }
        assert!(sampler.flush().len() <= 2);
    }
}
