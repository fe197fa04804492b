// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-span validation and fix-up.
//!
//! Each rule either repairs the span in place or rejects it with a typed
//! reason. Applying [`normalize`] a second time to an accepted span is a
//! no-op, so downstream stages can rely on normalized fields without
//! tracking provenance.

use std::collections::HashMap;

use thiserror::Error;

use crate::span::Span;

pub const MAX_SERVICE_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TYPE_LEN: usize = 100;
pub const MAX_RESOURCE_LEN: usize = 5_000;

pub const DEFAULT_SERVICE_NAME: &str = "unnamed-service";
pub const DEFAULT_SPAN_NAME: &str = "unnamed_operation";

const NANOS_PER_SEC: i64 = 1_000_000_000;
/// Spans may not start more than one year in the past.
const MAX_START_AGE_NS: i64 = 365 * 24 * 3600 * NANOS_PER_SEC;
/// Spans may not start more than ten minutes in the future.
const MAX_START_AHEAD_NS: i64 = 10 * 60 * NANOS_PER_SEC;

/// Reason a span could not be repaired and must be dropped.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("zero trace id")]
    ZeroTraceId,
    #[error("zero span id")]
    ZeroSpanId,
    #[error("duration {0}ns above the configured maximum")]
    ExcessiveDuration(i64),
    #[error("start {0} outside the accepted time window")]
    StartOutOfRange(i64),
}

/// Validates `span` in place.
///
/// `now_ns` anchors the start-time window and `max_duration_ns` bounds the
/// span duration. Returns the drop reason when the span cannot be fixed;
/// the caller removes such spans and keeps their siblings.
pub fn normalize(span: &mut Span, now_ns: i64, max_duration_ns: i64) -> Result<(), NormalizeError> {
    if span.service.is_empty() {
        span.service = DEFAULT_SERVICE_NAME.to_string();
    }
    span.service = normalize_service(&span.service);

    if span.name.is_empty() {
        span.name = DEFAULT_SPAN_NAME.to_string();
    }
    truncate_utf8(&mut span.name, MAX_NAME_LEN);

    if span.resource.is_empty() {
        span.resource = span.name.clone();
    }
    truncate_utf8(&mut span.resource, MAX_RESOURCE_LEN);

    if span.trace_id == 0 {
        return Err(NormalizeError::ZeroTraceId);
    }
    if span.span_id == 0 {
        return Err(NormalizeError::ZeroSpanId);
    }

    if span.duration < 0 {
        span.duration = 0;
    }
    if span.duration > max_duration_ns {
        return Err(NormalizeError::ExcessiveDuration(span.duration));
    }

    if span.start < now_ns - MAX_START_AGE_NS || span.start > now_ns + MAX_START_AHEAD_NS {
        return Err(NormalizeError::StartOutOfRange(span.start));
    }

    if !span.meta.is_empty() {
        span.meta = clean_keys(std::mem::take(&mut span.meta));
    }
    if !span.metrics.is_empty() {
        span.metrics = clean_keys(std::mem::take(&mut span.metrics))
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .collect();
    }

    truncate_utf8(&mut span.span_type, MAX_TYPE_LEN);

    Ok(())
}

/// Lowercases, strips anything outside `[a-z0-9_\-.]` and bounds the length.
fn normalize_service(service: &str) -> String {
    let mut out = String::with_capacity(service.len().min(MAX_SERVICE_LEN));
    for c in service.chars() {
        let c = c.to_ascii_lowercase();
        if matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | '.') {
            if out.len() >= MAX_SERVICE_LEN {
                break;
            }
            out.push(c);
        }
    }
    out
}

/// Truncates to at most `max` bytes without splitting a UTF-8 character.
pub(crate) fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    s.truncate(idx);
}

fn clean_keys<V>(map: HashMap<String, V>) -> HashMap<String, V> {
    map.into_iter()
        .filter_map(|(k, v)| {
            let trimmed = k.trim();
            if trimmed.is_empty() {
                return None;
            }
            let k = if trimmed.len() == k.len() { k } else { trimmed.to_string() };
            Some((k, v))
        })
        .collect()
}
