// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregated statistics grouped per time bucket.

use std::collections::HashMap;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::sketch::QuantileSketch;
use crate::span::Span;
use crate::sublayers::SublayerValue;

/// The dimensions a span's measurements are grouped by inside a bucket.
///
/// `extra` holds the values of the configured extra aggregator tags, in
/// aggregator order (the concentrator keeps that list sorted).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub env: String,
    pub service: String,
    pub resource: String,
    pub name: String,
    pub extra: Vec<(String, String)>,
}

impl AggregationKey {
    pub fn from_span(span: &Span, env: &str, aggregators: &[String]) -> Self {
        AggregationKey {
            env: env.to_string(),
            service: span.service.clone(),
            resource: span.resource.clone(),
            name: span.name.clone(),
            extra: aggregators
                .iter()
                .filter_map(|tag| {
                    span.meta
                        .get(tag)
                        .map(|value| (tag.clone(), value.clone()))
                })
                .collect(),
        }
    }
}

/// Measurements accumulated for one aggregation key.
#[derive(Clone, Debug)]
pub struct GroupedStats {
    pub hits: u64,
    pub errors: u64,
    pub duration_sum: u64,
    pub duration_sq_sum: f64,
    pub duration_sketch: QuantileSketch,
    /// Per-type exclusive durations, accumulated from root spans only.
    pub sublayers: HashMap<String, f64>,
}

impl GroupedStats {
    fn new() -> Self {
        GroupedStats {
            hits: 0,
            errors: 0,
            duration_sum: 0,
            duration_sq_sum: 0.0,
            duration_sketch: QuantileSketch::default(),
            sublayers: HashMap::new(),
        }
    }
}

/// Statistics for one half-open time interval `[start, start + duration)`.
#[derive(Clone, Debug)]
pub struct StatsBucket {
    /// Nanoseconds since epoch, aligned down to the bucket size.
    pub start: i64,
    /// Bucket size in nanoseconds.
    pub duration: i64,
    pub stats: HashMap<AggregationKey, GroupedStats>,
}

impl StatsBucket {
    pub fn new(start: i64, duration: i64) -> Self {
        StatsBucket {
            start,
            duration,
            stats: HashMap::new(),
        }
    }

    /// Folds one span into the bucket. `sublayers` is only passed for the
    /// root span of a trace carrying a decomposition.
    pub fn handle_span(
        &mut self,
        span: &Span,
        env: &str,
        aggregators: &[String],
        sublayers: Option<&[SublayerValue]>,
    ) {
        let key = AggregationKey::from_span(span, env, aggregators);
        let grouped = self.stats.entry(key).or_insert_with(GroupedStats::new);

        grouped.hits += 1;
        if span.error != 0 {
            grouped.errors += 1;
        }
        let duration = span.duration.max(0);
        grouped.duration_sum += duration as u64;
        grouped.duration_sq_sum += (duration as f64) * (duration as f64);
        grouped.duration_sketch.insert(duration as f64);

        if let Some(values) = sublayers {
            for value in values {
                *grouped
                    .sublayers
                    .entry(value.span_type.clone())
                    .or_default() += value.duration_ns;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[derive(Serialize)]
struct WireEntry<'a> {
    env: &'a str,
    service: &'a str,
    resource: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    hits: u64,
    errors: u64,
    duration: u64,
    duration_sq: f64,
    p95: f64,
    #[serde(skip_serializing_if = "sublayers_empty")]
    sublayers: &'a HashMap<String, f64>,
}

fn sublayers_empty(sublayers: &&HashMap<String, f64>) -> bool {
    sublayers.is_empty()
}

// Buckets serialize as `{start, duration, stats: [entries]}`; the map is
// flattened into a key-sorted list so output is stable across runs.
impl Serialize for StatsBucket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut entries: Vec<(&AggregationKey, &GroupedStats)> = self.stats.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let wire: Vec<WireEntry<'_>> = entries
            .into_iter()
            .map(|(key, grouped)| WireEntry {
                env: &key.env,
                service: &key.service,
                resource: &key.resource,
                name: &key.name,
                tags: key
                    .extra
                    .iter()
                    .map(|(tag, value)| format!("{tag}:{value}"))
                    .collect(),
                hits: grouped.hits,
                errors: grouped.errors,
                duration: grouped.duration_sum,
                duration_sq: grouped.duration_sq_sum,
                p95: grouped.duration_sketch.quantile(0.95),
                sublayers: &grouped.sublayers,
            })
            .collect();

        let mut state = serializer.serialize_struct("StatsBucket", 3)?;
        state.serialize_field("start", &self.start)?;
        state.serialize_field("duration", &self.duration)?;
        state.serialize_field("stats", &wire)?;
        state.end()
    }
}
