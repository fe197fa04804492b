// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP intake for traces and service metadata.
//!
//! Terminates HTTP, picks a decoder from the endpoint version and
//! content type, groups spans into traces, validates them, and forwards
//! survivors on a bounded channel. A full channel blocks the handler:
//! backpressure reaches the client as latency, never as dropped data.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::http;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::http_utils::{
    content_length_exceeds, error_response, not_found_response, ok_response, BoxedResponse,
};
use crate::metrics::StatsClient;
use crate::normalize::normalize;
use crate::span::{now_nanos, Span};
use crate::trace::{ServicesMetadata, Trace};

/// Buffered so handlers are not waiting on downstream processing.
pub const TRACE_CHANNEL_CAPACITY: usize = 50;
pub const SERVICES_CHANNEL_CAPACITY: usize = 50;

/// Keep-alive clients can hold connections open too long; bound reads.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// The connection budget refreshes every lease.
const CONNECTION_LEASE: Duration = Duration::from_secs(30);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    V01,
    V02,
    V03,
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApiVersion::V01 => "v0.1",
            ApiVersion::V02 => "v0.2",
            ApiVersion::V03 => "v0.3",
        })
    }
}

/// Counters tracked across requests and reported every 10 seconds.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub spans_received: AtomicI64,
    pub traces_received: AtomicI64,
    pub spans_dropped: AtomicI64,
    pub traces_dropped: AtomicI64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub spans_received: i64,
    pub traces_received: i64,
    pub spans_dropped: i64,
    pub traces_dropped: i64,
}

impl ReceiverStats {
    /// Loads the counters and resets them for the next interval.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            spans_received: self.spans_received.swap(0, Ordering::Relaxed),
            traces_received: self.traces_received.swap(0, Ordering::Relaxed),
            spans_dropped: self.spans_dropped.swap(0, Ordering::Relaxed),
            traces_dropped: self.traces_dropped.swap(0, Ordering::Relaxed),
        }
    }
}

pub struct HttpReceiver {
    config: Arc<Config>,
    traces_tx: mpsc::Sender<Trace>,
    services_tx: mpsc::Sender<ServicesMetadata>,
    pub stats: ReceiverStats,
    stats_client: Arc<dyn StatsClient>,
    cancel: CancellationToken,
    /// In-flight validation tasks; handlers respond before these finish.
    tasks: TaskTracker,
}

impl HttpReceiver {
    pub fn new(
        config: Arc<Config>,
        traces_tx: mpsc::Sender<Trace>,
        services_tx: mpsc::Sender<ServicesMetadata>,
        stats_client: Arc<dyn StatsClient>,
        cancel: CancellationToken,
    ) -> Self {
        HttpReceiver {
            config,
            traces_tx,
            services_tx,
            stats: ReceiverStats::default(),
            stats_client,
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    /// Binds the listener and serves until cancellation. A failed bind is
    /// fatal and aborts startup.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let addr = format!(
            "{}:{}",
            self.config.receiver_host, self.config.receiver_port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("could not bind trace receiver to {addr}"))?;
        info!("listening for traces at http://{addr}/");

        let stats_self = self.clone();
        tokio::spawn(async move { stats_self.log_stats().await });

        self.serve(listener).await
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut server = http1::Builder::new();
        server
            .timer(TokioTimer::new())
            .header_read_timeout(READ_TIMEOUT);

        let mut joinset = JoinSet::new();
        let mut lease = tokio::time::interval(CONNECTION_LEASE);
        let mut accepted_this_lease = 0usize;

        loop {
            let conn = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = lease.tick() => {
                    accepted_this_lease = 0;
                    continue;
                }
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("connection handler panicked: {e:?}");
                        continue;
                    }
                    Ok(()) | Err(_) => continue,
                },
                accept = listener.accept() => match accept {
                    Err(e) if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) => continue,
                    Err(e) => {
                        error!("accept error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, peer)) => {
                        accepted_this_lease += 1;
                        if accepted_this_lease > self.config.connection_limit {
                            debug!(%peer, "connection budget exhausted for this lease, rejecting");
                            continue;
                        }
                        conn
                    }
                },
            };

            let receiver = self.clone();
            let service = service_fn(move |req| {
                let receiver = receiver.clone();
                async move { receiver.handle(req).await }
            });
            let io = TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(io, service).await {
                    debug!("connection error: {e}");
                }
            });
        }

        // let in-flight requests finish, then the validation they spawned;
        // only after that does the last trace-channel sender drop, which is
        // what releases the orchestrator into its final flush
        while joinset.join_next().await.is_some() {}
        self.tasks.close();
        self.tasks.wait().await;
        Ok(())
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>) -> http::Result<BoxedResponse> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        if method != Method::POST && method != Method::PUT {
            return not_found_response();
        }

        match path.as_str() {
            "/spans" | "/v0.1/spans" => self.handle_traces(ApiVersion::V01, req).await,
            "/v0.2/traces" => self.handle_traces(ApiVersion::V02, req).await,
            "/v0.3/traces" => self.handle_traces(ApiVersion::V03, req).await,
            "/services" | "/v0.1/services" => self.handle_services(ApiVersion::V01, req).await,
            "/v0.2/services" => self.handle_services(ApiVersion::V02, req).await,
            "/v0.3/services" => self.handle_services(ApiVersion::V03, req).await,
            _ => not_found_response(),
        }
    }

    /// Reads the full request body, bounded by the configured limit and the
    /// read timeout. Returns the response to send when the body is refused.
    async fn read_body(
        &self,
        req: Request<Incoming>,
        tags: &[String],
    ) -> Result<(http::request::Parts, Bytes), http::Result<BoxedResponse>> {
        let (parts, body) = req.into_parts();

        if content_length_exceeds(&parts.headers, self.config.max_request_content_length) {
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload-too-large",
                self.stats_client.as_ref(),
                tags,
            ));
        }

        let collected = match tokio::time::timeout(READ_TIMEOUT, body.collect()).await {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                debug!("failed reading request body: {e}");
                return Err(error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "body-read-error",
                    self.stats_client.as_ref(),
                    tags,
                ));
            }
            Err(_) => {
                return Err(error_response(
                    StatusCode::REQUEST_TIMEOUT,
                    "body-read-timeout",
                    self.stats_client.as_ref(),
                    tags,
                ));
            }
        };

        let bytes = collected.to_bytes();
        if bytes.len() > self.config.max_request_content_length {
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload-too-large",
                self.stats_client.as_ref(),
                tags,
            ));
        }
        Ok((parts, bytes))
    }

    async fn handle_traces(
        self: Arc<Self>,
        version: ApiVersion,
        req: Request<Incoming>,
    ) -> http::Result<BoxedResponse> {
        let tags = vec!["handler:traces".to_string(), format!("v:{version}")];
        let (parts, body) = match self.read_body(req, &tags).await {
            Ok(read) => read,
            Err(response) => return response,
        };
        let content_type = content_type_of(&parts.headers);

        let traces = match self.decode_traces(version, content_type, &body, &tags) {
            Ok(traces) => traces,
            Err(response) => return response,
        };

        // fire-and-forget from the client's perspective: the 200 goes out on
        // decode success, validation and the (possibly blocking) channel
        // send continue in the background
        let receiver = self.clone();
        self.tasks
            .spawn(async move { receiver.process_traces(traces).await });
        ok_response()
    }

    fn decode_traces(
        &self,
        version: ApiVersion,
        content_type: &str,
        body: &[u8],
        tags: &[String],
    ) -> Result<Vec<Trace>, http::Result<BoxedResponse>> {
        // v0.1 and v0.2 are JSON-only endpoints
        if matches!(version, ApiVersion::V01 | ApiVersion::V02)
            && !is_json_content_type(content_type)
        {
            debug!("found {content_type:?}; unsupported media type");
            return Err(error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported-media-type",
                self.stats_client.as_ref(),
                tags,
            ));
        }

        let decoded = match version {
            // the legacy shape: a flat span list regrouped by trace id
            ApiVersion::V01 => serde_json::from_slice::<Vec<Span>>(body)
                .map(group_spans_by_trace_id)
                .map_err(|e| e.to_string()),
            ApiVersion::V02 => serde_json::from_slice::<Vec<Trace>>(body).map_err(|e| e.to_string()),
            ApiVersion::V03 => {
                if is_msgpack_content_type(content_type) {
                    rmp_serde::from_slice::<Vec<Trace>>(body).map_err(|e| e.to_string())
                } else {
                    serde_json::from_slice::<Vec<Trace>>(body).map_err(|e| e.to_string())
                }
            }
        };

        decoded.map_err(|e| {
            debug!("failed to decode {version} traces payload: {e}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "decoding-error",
                self.stats_client.as_ref(),
                tags,
            )
        })
    }

    /// Validates decoded traces and forwards survivors on the trace
    /// channel. Decode already succeeded, so failures here only affect
    /// counters, not the HTTP status.
    pub(crate) async fn process_traces(&self, traces: Vec<Trace>) {
        let now = now_nanos();
        let max_duration = self.config.max_span_duration_ns();

        let mut spans_total = 0i64;
        let mut spans_dropped = 0i64;
        let mut traces_kept = 0i64;
        let mut traces_dropped = 0i64;

        'traces: for mut trace in traces {
            if trace.is_empty() {
                continue;
            }
            if trace.len() == 1 && trace[0].is_flush_marker() {
                // forces a pipeline flush; invisible to accounting
                let _ = self.traces_tx.send(trace).await;
                continue;
            }

            spans_total += trace.len() as i64;

            // several trace ids inside one trace is a client bug; drop whole
            let trace_id = trace[0].trace_id;
            for span in &trace[1..] {
                if span.trace_id != trace_id {
                    debug!(
                        expected = trace_id,
                        found = span.trace_id,
                        "dropping trace, trace id mismatch"
                    );
                    spans_dropped += trace.len() as i64;
                    traces_dropped += 1;
                    continue 'traces;
                }
            }

            let mut to_remove = Vec::new();
            for (i, span) in trace.iter_mut().enumerate() {
                if let Err(reason) = normalize(span, now, max_duration) {
                    debug!(%reason, "dropping span, could not normalize");
                    to_remove.push(i);
                }
            }
            spans_dropped += to_remove.len() as i64;

            if to_remove.len() == trace.len() {
                traces_dropped += 1;
                continue;
            }
            // indices are ascending; removing back-to-front keeps them valid
            for &i in to_remove.iter().rev() {
                trace.swap_remove(i);
            }

            // blocks when the pipeline is saturated: that is the backpressure
            if self.traces_tx.send(trace).await.is_err() {
                traces_dropped += 1;
                continue;
            }
            traces_kept += 1;
        }

        self.stats
            .spans_received
            .fetch_add(spans_total, Ordering::Relaxed);
        self.stats
            .traces_received
            .fetch_add(traces_kept, Ordering::Relaxed);
        self.stats
            .spans_dropped
            .fetch_add(spans_dropped, Ordering::Relaxed);
        self.stats
            .traces_dropped
            .fetch_add(traces_dropped, Ordering::Relaxed);
    }

    async fn handle_services(
        &self,
        version: ApiVersion,
        req: Request<Incoming>,
    ) -> http::Result<BoxedResponse> {
        let tags = vec!["handler:services".to_string(), format!("v:{version}")];
        let (parts, body) = match self.read_body(req, &tags).await {
            Ok(read) => read,
            Err(response) => return response,
        };
        let content_type = content_type_of(&parts.headers);

        if matches!(version, ApiVersion::V01 | ApiVersion::V02)
            && !is_json_content_type(content_type)
        {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported-media-type",
                self.stats_client.as_ref(),
                &tags,
            );
        }

        let decoded = if version == ApiVersion::V03 && is_msgpack_content_type(content_type) {
            rmp_serde::from_slice::<ServicesMetadata>(&body).map_err(|e| e.to_string())
        } else {
            serde_json::from_slice::<ServicesMetadata>(&body).map_err(|e| e.to_string())
        };
        let services = match decoded {
            Ok(services) => services,
            Err(e) => {
                debug!("failed to decode {version} services payload: {e}");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "decoding-error",
                    self.stats_client.as_ref(),
                    &tags,
                );
            }
        };

        self.stats_client
            .count("trace_agent.receiver.service", services.len() as i64, &tags);
        let _ = self.services_tx.send(services).await;
        ok_response()
    }

    /// Periodically reports the receiver counters and resets them.
    async fn log_stats(&self) {
        let mut interval = tokio::time::interval(STATS_LOG_INTERVAL);
        interval.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            let snapshot = self.stats.snapshot_and_reset();
            self.stats_client
                .count("trace_agent.receiver.span", snapshot.spans_received, &[]);
            self.stats_client
                .count("trace_agent.receiver.trace", snapshot.traces_received, &[]);
            self.stats_client
                .count("trace_agent.receiver.span_dropped", snapshot.spans_dropped, &[]);
            self.stats_client.count(
                "trace_agent.receiver.trace_dropped",
                snapshot.traces_dropped,
                &[],
            );
            info!(
                "receiver handled {} spans, dropped {} ; handled {} traces, dropped {}",
                snapshot.spans_received,
                snapshot.spans_dropped,
                snapshot.traces_received,
                snapshot.traces_dropped
            );
        }
    }
}

fn content_type_of(headers: &header::HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn is_json_content_type(content_type: &str) -> bool {
    matches!(content_type, "" | "application/json" | "text/json")
}

fn is_msgpack_content_type(content_type: &str) -> bool {
    content_type == "application/msgpack"
}

/// v0.1 payloads are flat span lists; rebuild traces by trace id.
fn group_spans_by_trace_id(spans: Vec<Span>) -> Vec<Trace> {
    let mut by_id: std::collections::BTreeMap<u64, Trace> = std::collections::BTreeMap::new();
    for span in spans {
        by_id.entry(span.trace_id).or_default().push(span);
    }
    by_id.into_values().collect()
}
