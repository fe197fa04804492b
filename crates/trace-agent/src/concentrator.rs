// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-bucketed statistics aggregation.
//!
//! Buckets are keyed by aligned start time rather than kept in a ring:
//! out-of-order spans are common, and keyed access lets a late span land
//! in the correct bucket as long as that bucket has not been flushed yet.
//! A flush only returns buckets at least one full interval old, so the
//! currently-open bucket keeps absorbing late arrivals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::metrics::StatsClient;
use crate::stats::StatsBucket;
use crate::trace::ProcessedTrace;

pub struct Concentrator {
    /// Extra meta tags widening the aggregation key, kept sorted.
    aggregators: Vec<String>,
    bucket_size_ns: i64,
    buckets: Mutex<HashMap<i64, StatsBucket>>,
    stats_client: Arc<dyn StatsClient>,
}

impl Concentrator {
    pub fn new(
        mut aggregators: Vec<String>,
        bucket_size: Duration,
        stats_client: Arc<dyn StatsClient>,
    ) -> Self {
        aggregators.sort();
        Concentrator {
            aggregators,
            bucket_size_ns: bucket_size.as_nanos() as i64,
            buckets: Mutex::new(HashMap::new()),
            stats_client,
        }
    }

    /// Folds every span of the trace into its bucket. The lock is held for
    /// the duration of the insert only, never across I/O.
    pub fn add(&self, pt: &ProcessedTrace) {
        let mut buckets = self.lock_buckets();
        for (i, span) in pt.trace.iter().enumerate() {
            let btime = span.end() - span.end().rem_euclid(self.bucket_size_ns);
            let bucket = buckets
                .entry(btime)
                .or_insert_with(|| StatsBucket::new(btime, self.bucket_size_ns));

            let sublayers = (i == pt.root && !pt.sublayers.is_empty())
                .then(|| pt.sublayers.as_slice());
            bucket.handle_span(span, &pt.env, &self.aggregators, sublayers);
        }
    }

    /// Removes and returns every complete bucket. A bucket is complete when
    /// its start is at least one bucket size older than `now_ns`; the open
    /// bucket is never flushed.
    pub fn flush(&self, now_ns: i64) -> Vec<StatsBucket> {
        let cutoff = now_ns - self.bucket_size_ns;
        let mut flushed = Vec::new();

        {
            let mut buckets = self.lock_buckets();
            let ready: Vec<i64> = buckets
                .keys()
                .copied()
                .filter(|&ts| ts <= cutoff)
                .collect();
            for ts in ready {
                if let Some(bucket) = buckets.remove(&ts) {
                    debug!(bucket_start = ts, "flushing stats bucket");
                    flushed.push(bucket);
                }
            }
        }

        flushed.sort_by_key(|b| b.start);
        for bucket in &flushed {
            for grouped in bucket.stats.values() {
                self.stats_client.histogram(
                    "trace_agent.distribution.len",
                    grouped.duration_sketch.count() as f64,
                    &[],
                );
            }
        }
        flushed
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<i64, StatsBucket>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
