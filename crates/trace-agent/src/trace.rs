// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traces and the per-trace resolution the orchestrator performs before
//! fanning out to the aggregators.

use std::collections::{HashMap, HashSet};

use crate::span::Span;
use crate::sublayers::SublayerValue;

/// All spans sharing one trace id, as decoded from a client payload.
pub type Trace = Vec<Span>;

/// Service metadata reported on the `/services` endpoints: service name to
/// arbitrary key/value attributes (`app`, `app_type`, ...).
pub type ServicesMetadata = HashMap<String, HashMap<String, String>>;

/// Meta key carrying the environment a trace was emitted from.
const ENV_TAG: &str = "env";

/// Index of the root span: the unique span whose `parent_id` is 0 or not
/// present in the trace. Ambiguity (several candidates, or none in case of
/// a reference cycle) resolves to the earliest start.
pub fn get_root(trace: &Trace) -> Option<usize> {
    if trace.is_empty() {
        return None;
    }

    let ids: HashSet<u64> = trace.iter().map(|s| s.span_id).collect();
    let mut root: Option<usize> = None;
    for (i, span) in trace.iter().enumerate() {
        if span.parent_id == 0 || !ids.contains(&span.parent_id) {
            root = match root {
                Some(r) if trace[r].start <= span.start => Some(r),
                _ => Some(i),
            };
        }
    }

    // Every span points at another span in the trace: broken client data,
    // fall back to the earliest start.
    root.or_else(|| {
        trace
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.start)
            .map(|(i, _)| i)
    })
}

/// Environment the trace belongs to: the root's `env` tag, or the agent
/// default when the tag is absent.
pub fn get_env(trace: &Trace, root: usize, default_env: &str) -> String {
    trace[root]
        .meta
        .get(ENV_TAG)
        .cloned()
        .unwrap_or_else(|| default_env.to_string())
}

/// A trace after orchestrator processing: resolved root and environment,
/// pre-computed sublayer decomposition, all spans quantized.
#[derive(Clone, Debug)]
pub struct ProcessedTrace {
    pub trace: Trace,
    /// Index of the root span within `trace`.
    pub root: usize,
    pub env: String,
    pub sublayers: Vec<SublayerValue>,
}

impl ProcessedTrace {
    pub fn root_span(&self) -> &Span {
        &self.trace[self.root]
    }
}
