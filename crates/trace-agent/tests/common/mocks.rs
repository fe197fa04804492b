// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock collaborators for integration tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};

use trace_agent::payload::AgentPayload;
use trace_agent::trace::ServicesMetadata;
use trace_agent::writer::PayloadWriter;

/// Captures everything the pipeline would ship upstream.
#[derive(Default)]
pub struct CapturingWriter {
    pub payloads: Mutex<Vec<AgentPayload>>,
    pub services: Mutex<Vec<ServicesMetadata>>,
}

#[async_trait]
impl PayloadWriter for CapturingWriter {
    async fn write_payload(&self, payload: AgentPayload) {
        self.payloads.lock().unwrap().push(payload);
    }

    async fn write_services(&self, services: ServicesMetadata) {
        self.services.lock().unwrap().push(services);
    }
}

impl CapturingWriter {
    /// Polls the captured payloads until `predicate` matches or `timeout`
    /// elapses. Returns whether a match was seen.
    pub async fn wait_for_payload<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&AgentPayload) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if self.payloads.lock().unwrap().iter().any(&predicate) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait_for_services(&self, timeout: Duration) -> Option<ServicesMetadata> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(services) = self.services.lock().unwrap().first() {
                return Some(services.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}
