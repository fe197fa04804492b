// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use trace_agent::{
    agent::Agent,
    concentrator::Concentrator,
    config::Config,
    metrics::NoopStatsClient,
    receiver::{HttpReceiver, SERVICES_CHANNEL_CAPACITY, TRACE_CHANNEL_CAPACITY},
    sampler::ResourceQuantileSampler,
    span::{now_nanos, Span},
    writer::{Writer, PAYLOAD_CHANNEL_CAPACITY},
};

use super::mocks::CapturingWriter;

/// A whole agent pipeline wired to a capturing writer.
pub struct TestAgent {
    pub writer: Arc<CapturingWriter>,
    pub cancel: CancellationToken,
}

/// Starts receiver, orchestrator and writer exactly as the binary does,
/// but captures outgoing payloads instead of shipping them.
pub async fn spawn_test_agent(config: Config) -> TestAgent {
    let config = Arc::new(config);
    let stats_client = Arc::new(NoopStatsClient);
    let cancel = CancellationToken::new();
    let capturing = Arc::new(CapturingWriter::default());

    let (traces_tx, traces_rx) = mpsc::channel(TRACE_CHANNEL_CAPACITY);
    let (services_tx, services_rx) = mpsc::channel(SERVICES_CHANNEL_CAPACITY);
    let (payloads_tx, payloads_rx) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);

    let receiver = Arc::new(HttpReceiver::new(
        config.clone(),
        traces_tx,
        services_tx,
        stats_client.clone(),
        cancel.clone(),
    ));
    let concentrator = Arc::new(Concentrator::new(
        config.extra_aggregators.clone(),
        config.bucket_interval,
        stats_client,
    ));
    let sampler = Arc::new(ResourceQuantileSampler::new(&config));
    let writer = Writer::new(capturing.clone(), payloads_rx, services_rx);
    let agent = Agent::new(
        config,
        concentrator,
        sampler,
        traces_rx,
        payloads_tx,
        cancel.clone(),
    );

    tokio::spawn(async move {
        let _ = receiver.run().await;
    });
    tokio::spawn(writer.run());
    tokio::spawn(agent.run());

    // give the listener time to bind
    tokio::time::sleep(Duration::from_millis(100)).await;

    TestAgent {
        writer: capturing,
        cancel,
    }
}

/// A span starting now with sane defaults for every required field.
pub fn test_span(trace_id: u64, span_id: u64, parent_id: u64) -> Span {
    Span {
        service: "s".to_string(),
        name: "n".to_string(),
        resource: "r".to_string(),
        trace_id,
        span_id,
        parent_id,
        start: now_nanos() - 1_000_000,
        duration: 1_000_000,
        error: 0,
        ..Span::default()
    }
}

/// Send an HTTP request over TCP and return the response
pub async fn send_request(
    port: u16,
    path: &str,
    method: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(path)
        .method(method)
        .header("Content-Length", body.len().to_string());
    if let Some(content_type) = content_type {
        request_builder = request_builder.header("Content-Type", content_type);
    }
    let request = request_builder.body(Full::new(Bytes::from(body)))?;

    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;
    Ok(response)
}

pub async fn response_body_string(response: Response<hyper::body::Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
