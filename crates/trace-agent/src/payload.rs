// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The payload assembled on each flush tick.

use serde::Serialize;

use crate::stats::StatsBucket;
use crate::trace::Trace;

/// Everything one flush produces: complete stats buckets plus the sampled
/// traces, stamped with the agent's host and default environment.
#[derive(Clone, Debug, Default, Serialize)]
pub struct AgentPayload {
    pub host_name: String,
    pub env: String,
    pub stats: Vec<StatsBucket>,
    pub traces: Vec<Trace>,
}

impl AgentPayload {
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty() && self.traces.is_empty()
    }

    pub fn span_count(&self) -> usize {
        self.traces.iter().map(Vec::len).sum()
    }
}
