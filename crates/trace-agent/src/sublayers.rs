// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-type duration decomposition of a trace.
//!
//! For each span type appearing under the root, the sublayer value is the
//! wall-clock time exclusively attributed to spans of that type: a span's
//! own duration minus the portions covered by its children. Overlapping
//! children are merged first so concurrent children are not subtracted
//! twice.

use std::collections::HashMap;

use crate::span::Span;
use crate::trace::Trace;

/// Metric-key prefix under which sublayer durations are pinned on the root.
pub const SUBLAYER_DURATION_PREFIX: &str = "_sublayers.duration.by_type.";
/// Metric carrying the number of spans in the trace.
pub const SUBLAYER_SPAN_COUNT: &str = "_sublayers.span_count";

#[derive(Clone, Debug, PartialEq)]
pub struct SublayerValue {
    pub span_type: String,
    /// Exclusive wall-clock nanoseconds attributed to this type.
    pub duration_ns: f64,
}

/// Computes the per-type exclusive-duration decomposition of `trace`.
///
/// Spans with an empty type contribute nothing. The result is sorted by
/// type name so the output is deterministic.
pub fn compute_sublayers(trace: &Trace) -> Vec<SublayerValue> {
    let mut children: HashMap<u64, Vec<&Span>> = HashMap::new();
    for span in trace {
        children.entry(span.parent_id).or_default().push(span);
    }

    let mut by_type: HashMap<&str, f64> = HashMap::new();
    for span in trace {
        if span.span_type.is_empty() || span.duration <= 0 {
            continue;
        }
        let covered = children
            .get(&span.span_id)
            .map(|kids| covered_within(span, kids))
            .unwrap_or(0);
        let exclusive = (span.duration - covered).max(0);
        *by_type.entry(span.span_type.as_str()).or_default() += exclusive as f64;
    }

    let mut values: Vec<SublayerValue> = by_type
        .into_iter()
        .map(|(span_type, duration_ns)| SublayerValue {
            span_type: span_type.to_string(),
            duration_ns,
        })
        .collect();
    values.sort_by(|a, b| a.span_type.cmp(&b.span_type));
    values
}

/// Attaches the decomposition to the root span's metrics.
pub fn pin_sublayers(root: &mut Span, sublayers: &[SublayerValue], span_count: usize) {
    for value in sublayers {
        root.metrics.insert(
            format!("{}{}", SUBLAYER_DURATION_PREFIX, value.span_type),
            value.duration_ns,
        );
    }
    root.metrics
        .insert(SUBLAYER_SPAN_COUNT.to_string(), span_count as f64);
}

/// Total length of `span`'s interval covered by `kids`, merging overlaps.
fn covered_within(span: &Span, kids: &[&Span]) -> i64 {
    let mut intervals: Vec<(i64, i64)> = kids
        .iter()
        .map(|k| (k.start.max(span.start), k.end().min(span.end())))
        .filter(|(s, e)| e > s)
        .collect();
    intervals.sort_unstable();

    let mut covered = 0;
    let mut cursor = i64::MIN;
    for (start, end) in intervals {
        let start = start.max(cursor);
        if end > start {
            covered += end - start;
            cursor = end;
        }
        cursor = cursor.max(end);
    }
    covered
}
