// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The upstream hand-off seam.
//!
//! The pipeline ends at [`PayloadWriter`]; delivery mechanics (endpoints,
//! auth, compression, retries) live behind it. The [`Writer`] task drains
//! the payload and services channels and exits once both close, so
//! shutdown is a matter of dropping the senders.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::payload::AgentPayload;
use crate::trace::ServicesMetadata;

/// Payload input channel; kept small so a stalled upstream pushes back on
/// the flush path instead of buffering without bound.
pub const PAYLOAD_CHANNEL_CAPACITY: usize = 5;

#[async_trait]
pub trait PayloadWriter: Send + Sync {
    async fn write_payload(&self, payload: AgentPayload);
    async fn write_services(&self, services: ServicesMetadata);
}

/// Logs what would be shipped. Stands in where no upstream is configured.
pub struct LogWriter;

#[async_trait]
impl PayloadWriter for LogWriter {
    async fn write_payload(&self, payload: AgentPayload) {
        info!(
            host = %payload.host_name,
            env = %payload.env,
            stats_buckets = payload.stats.len(),
            traces = payload.traces.len(),
            spans = payload.span_count(),
            "flushing payload"
        );
    }

    async fn write_services(&self, services: ServicesMetadata) {
        info!(services = services.len(), "flushing services metadata");
    }
}

pub struct Writer {
    writer: Arc<dyn PayloadWriter>,
    payloads_rx: mpsc::Receiver<AgentPayload>,
    services_rx: mpsc::Receiver<ServicesMetadata>,
}

impl Writer {
    pub fn new(
        writer: Arc<dyn PayloadWriter>,
        payloads_rx: mpsc::Receiver<AgentPayload>,
        services_rx: mpsc::Receiver<ServicesMetadata>,
    ) -> Self {
        Writer {
            writer,
            payloads_rx,
            services_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                payload = self.payloads_rx.recv() => match payload {
                    Some(payload) if payload.is_empty() => {
                        debug!("skipping empty payload");
                    }
                    Some(payload) => self.writer.write_payload(payload).await,
                    None => break,
                },
                services = self.services_rx.recv() => match services {
                    Some(services) => self.writer.write_services(services).await,
                    None => break,
                },
            }
        }

        // one side closed on shutdown; drain whatever the other still holds
        while let Some(payload) = self.payloads_rx.recv().await {
            if !payload.is_empty() {
                self.writer.write_payload(payload).await;
            }
        }
        while let Some(services) = self.services_rx.recv().await {
            self.writer.write_services(services).await;
        }
        info!("writer exiting");
    }
}
