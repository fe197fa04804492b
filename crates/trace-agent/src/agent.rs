// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline orchestration.
//!
//! Owns the flush tick and the flow between stages: traces accepted by the
//! receiver are processed (sublayers, root, late-trace cutoff, quantize)
//! and fanned out to the concentrator and the sampler over two bounded
//! channels with one consumer task each. On every tick both aggregators
//! are flushed into one payload for the writer.
//!
//! Before flushing, a barrier message is pushed through both fan-out
//! channels and acknowledged, so a flush observes every trace forwarded
//! before the tick; traces forwarded after it land in the next flush.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::concentrator::Concentrator;
use crate::config::Config;
use crate::payload::AgentPayload;
use crate::quantize::quantize;
use crate::sampler::ResourceQuantileSampler;
use crate::span::now_nanos;
use crate::sublayers::{compute_sublayers, pin_sublayers};
use crate::trace::{get_env, get_root, ProcessedTrace, Trace};

const FANOUT_CHANNEL_CAPACITY: usize = 50;

enum FanoutMessage {
    Trace(Arc<ProcessedTrace>),
    /// Acknowledged once every message before it has been consumed.
    Barrier(oneshot::Sender<()>),
}

enum Event {
    Trace(Option<Trace>),
    Tick,
    Exit,
}

pub struct Agent {
    config: Arc<Config>,
    concentrator: Arc<Concentrator>,
    sampler: Arc<ResourceQuantileSampler>,
    traces_rx: mpsc::Receiver<Trace>,
    payloads_tx: mpsc::Sender<AgentPayload>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        concentrator: Arc<Concentrator>,
        sampler: Arc<ResourceQuantileSampler>,
        traces_rx: mpsc::Receiver<Trace>,
        payloads_tx: mpsc::Sender<AgentPayload>,
        cancel: CancellationToken,
    ) -> Self {
        Agent {
            config,
            concentrator,
            sampler,
            traces_rx,
            payloads_tx,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let (concentrator_tx, concentrator_rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);
        let (sampler_tx, sampler_rx) = mpsc::channel(FANOUT_CHANNEL_CAPACITY);

        let concentrator = self.concentrator.clone();
        let concentrator_task =
            tokio::spawn(consume(concentrator_rx, move |pt| concentrator.add(&pt)));
        let sampler = self.sampler.clone();
        let sampler_task = tokio::spawn(consume(sampler_rx, move |pt| sampler.add(&pt)));

        let mut flush_interval = tokio::time::interval(self.config.bucket_interval);
        flush_interval.tick().await; // discard the immediate first tick

        loop {
            let event = tokio::select! {
                maybe_trace = self.traces_rx.recv() => Event::Trace(maybe_trace),
                _ = flush_interval.tick() => Event::Tick,
                _ = self.cancel.cancelled() => Event::Exit,
            };
            match event {
                Event::Trace(Some(trace)) if is_flush_marker_trace(&trace) => {
                    self.flush(&concentrator_tx, &sampler_tx).await;
                }
                Event::Trace(Some(trace)) => {
                    self.process(trace, &concentrator_tx, &sampler_tx).await;
                }
                Event::Tick => self.flush(&concentrator_tx, &sampler_tx).await,
                // receiver gone or exit broadcast: drain and stop
                Event::Trace(None) | Event::Exit => break,
            }
        }

        // traces the receiver already accepted still count: its in-flight
        // handlers hold trace-channel senders until their sends complete, so
        // consume until every sender lets go, then emit the one final flush
        while let Some(trace) = self.traces_rx.recv().await {
            if !is_flush_marker_trace(&trace) {
                self.process(trace, &concentrator_tx, &sampler_tx).await;
            }
        }
        self.flush(&concentrator_tx, &sampler_tx).await;

        drop(concentrator_tx);
        drop(sampler_tx);
        let _ = concentrator_task.await;
        let _ = sampler_task.await;
        info!("agent exiting");
        // dropping self closes the payload channel; the writer drains and stops
    }

    /// Prepares one accepted trace and hands it to both aggregators.
    async fn process(
        &self,
        mut trace: Trace,
        concentrator_tx: &mpsc::Sender<FanoutMessage>,
        sampler_tx: &mpsc::Sender<FanoutMessage>,
    ) {
        if trace.is_empty() {
            return;
        }

        let sublayers = compute_sublayers(&trace);
        let Some(root) = get_root(&trace) else {
            return;
        };
        let span_count = trace.len();
        pin_sublayers(&mut trace[root], &sublayers, span_count);

        if trace[root].end() < now_nanos() - self.config.oldest_span_cutoff_ns() {
            debug!(trace_id = trace[root].trace_id, "dropping late trace");
            return;
        }

        for span in trace.iter_mut() {
            quantize(span);
        }
        let env = get_env(&trace, root, &self.config.default_env);

        let pt = Arc::new(ProcessedTrace {
            trace,
            root,
            env,
            sublayers,
        });
        // neither aggregator mutates the trace, sharing one copy is safe
        let (sent_a, sent_b) = tokio::join!(
            concentrator_tx.send(FanoutMessage::Trace(pt.clone())),
            sampler_tx.send(FanoutMessage::Trace(pt)),
        );
        if sent_a.is_err() || sent_b.is_err() {
            debug!("aggregator channel closed, trace discarded");
        }
    }

    /// Flushes both aggregators concurrently and ships the combined payload.
    async fn flush(
        &self,
        concentrator_tx: &mpsc::Sender<FanoutMessage>,
        sampler_tx: &mpsc::Sender<FanoutMessage>,
    ) {
        self.barrier(concentrator_tx).await;
        self.barrier(sampler_tx).await;

        let now = now_nanos();
        let concentrator = self.concentrator.clone();
        let stats_task = tokio::spawn(async move { concentrator.flush(now) });
        let sampler = self.sampler.clone();
        let traces_task = tokio::spawn(async move { sampler.flush() });
        let (stats, traces) = tokio::join!(stats_task, traces_task);

        let payload = AgentPayload {
            host_name: self.config.hostname.clone(),
            env: self.config.default_env.clone(),
            stats: stats.unwrap_or_default(),
            traces: traces.unwrap_or_default(),
        };
        if self.payloads_tx.send(payload).await.is_err() {
            debug!("writer channel closed, discarding payload");
        }
    }

    /// Waits until the consumer behind `tx` has drained everything queued
    /// before this call.
    async fn barrier(&self, tx: &mpsc::Sender<FanoutMessage>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(FanoutMessage::Barrier(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

fn is_flush_marker_trace(trace: &Trace) -> bool {
    trace.len() == 1 && trace[0].is_flush_marker()
}

async fn consume<F>(mut rx: mpsc::Receiver<FanoutMessage>, mut apply: F)
where
    F: FnMut(Arc<ProcessedTrace>),
{
    while let Some(message) = rx.recv().await {
        match message {
            FanoutMessage::Trace(pt) => apply(pt),
            FanoutMessage::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
