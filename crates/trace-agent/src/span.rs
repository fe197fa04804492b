// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The span model shared by every pipeline stage.
//!
//! Spans arrive either as JSON or MessagePack; both wire formats use the
//! same field names, so a single serde definition covers every endpoint
//! version. Every field defaults so that sparse client payloads decode and
//! are then fixed up or rejected by normalization instead of failing the
//! whole request.

use std::collections::HashMap;
use std::time::UNIX_EPOCH;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Span type of the internal marker that forces a pipeline flush.
pub const FLUSH_MARKER_TYPE: &str = "_FLUSH_MARKER";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// The software running (e.g. `pylons`).
    #[serde(default)]
    pub service: String,
    /// The operation being measured (e.g. `pylons.render`).
    #[serde(default)]
    pub name: String,
    /// The natural key of what is measured (`/index`, `SELECT * FROM a WHERE id = ?`).
    #[serde(default)]
    pub resource: String,
    /// Shared by all spans of one trace.
    #[serde(default)]
    pub trace_id: u64,
    /// Unique within a trace.
    #[serde(default)]
    pub span_id: u64,
    /// Span id of the parent, 0 for a root.
    #[serde(default)]
    pub parent_id: u64,
    /// Nanoseconds since the Unix epoch.
    #[serde(default)]
    pub start: i64,
    /// Nanoseconds.
    #[serde(default)]
    pub duration: i64,
    /// 0 is OK, anything else is a failure.
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// Protocol or category associated with the span (`sql`, `http`, ...).
    #[serde(rename = "type", default)]
    pub span_type: String,
}

impl Span {
    /// End time of the span, nanoseconds since the Unix epoch.
    pub fn end(&self) -> i64 {
        self.start + self.duration
    }

    /// Tells whether this is a marker span, which signals the pipeline to flush.
    pub fn is_flush_marker(&self) -> bool {
        self.span_type == FLUSH_MARKER_TYPE
    }

    /// Returns a new flush marker.
    pub fn flush_marker() -> Span {
        Span {
            span_type: FLUSH_MARKER_TYPE.to_string(),
            ..Span::default()
        }
    }
}

/// Generates a random nonzero u64 usable as a trace or span id.
pub fn random_id() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX >> 1)
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    UNIX_EPOCH.elapsed().map_or(0, |d| d.as_nanos() as i64)
}
