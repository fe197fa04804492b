// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trace_agent::{
    agent::Agent,
    concentrator::Concentrator,
    config::Config,
    metrics::{NoopStatsClient, StatsClient, UdpStatsClient},
    receiver::{HttpReceiver, SERVICES_CHANNEL_CAPACITY, TRACE_CHANNEL_CAPACITY},
    sampler::ResourceQuantileSampler,
    writer::{LogWriter, Writer, PAYLOAD_CHANNEL_CAPACITY},
};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("DD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_target(true)
        .finish();
    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("invalid configuration, trace agent will not start: {e}");
            return;
        }
    };
    info!(
        hostname = %config.hostname,
        env = %config.default_env,
        port = config.receiver_port,
        "starting trace agent"
    );

    let stats_client: Arc<dyn StatsClient> =
        match UdpStatsClient::new(&config.statsd_host, config.statsd_port) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!("statsd client unavailable, internal metrics disabled: {e}");
                Arc::new(NoopStatsClient)
            }
        };

    let cancel = CancellationToken::new();
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
        stats_client.clone(),
    ));
    let sampler = Arc::new(ResourceQuantileSampler::new(&config));
    let writer = Writer::new(Arc::new(LogWriter), payloads_rx, services_rx);
    let agent = Agent::new(
        config,
        concentrator,
        sampler,
        traces_rx,
        payloads_tx,
        cancel.clone(),
    );

    let receiver_cancel = cancel.clone();
    let receiver_handle = tokio::spawn(async move {
        if let Err(e) = receiver.run().await {
            error!("receiver failed: {e:?}");
            // a receiver that cannot serve makes the whole agent pointless
            receiver_cancel.cancel();
        }
    });
    let writer_handle = tokio::spawn(writer.run());
    let agent_handle = tokio::spawn(agent.run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("exit signal received, shutting down"),
            Err(e) => error!("could not listen for exit signal: {e}"),
        },
        // a failed bind is fatal, the receiver cancels on its way out
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    let _ = agent_handle.await;
    let _ = receiver_handle.await;
    let _ = writer_handle.await;
    info!("exiting");
}
