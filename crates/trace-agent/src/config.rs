// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! The struct is the contract the pipeline consumes; values come from
//! `DD_*` environment variables with defaults that match the historical
//! agent. File-based configuration layers (INI) are resolved by the
//! packaging side and surface here as environment variables.

use std::env;
use std::time::Duration;

use anyhow::{bail, Result};

const DEFAULT_RECEIVER_PORT: u16 = 7777;
const DEFAULT_CONNECTION_LIMIT: usize = 2_000;
const DEFAULT_BUCKET_INTERVAL_SECS: u64 = 5;
const DEFAULT_OLDEST_SPAN_CUTOFF_SECS: u64 = 30;
const DEFAULT_MAX_TRACES_PER_SECOND: f64 = 10.0;
const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_SPAN_DURATION_SECS: u64 = 3_600;
const DEFAULT_STATSD_PORT: u16 = 8125;

#[derive(Clone, Debug)]
pub struct Config {
    /// Value put in outgoing `Payload.host_name`.
    pub hostname: String,
    /// Environment attached to traces that do not carry one.
    pub default_env: String,
    pub receiver_host: String,
    pub receiver_port: u16,
    /// Max connections accepted per 30-second listener lease.
    pub connection_limit: usize,
    /// Stats bucket size; also the flush tick.
    pub bucket_interval: Duration,
    /// Traces whose root ended earlier than this before now are dropped.
    pub oldest_span_cutoff: Duration,
    /// Meta tag names widening the stats aggregation key.
    pub extra_aggregators: Vec<String>,
    /// Final multiplicative keep-probability in the sampler, in [0, 1].
    pub extra_sample_rate: f64,
    /// Sampler output rate cap; 0 disables.
    pub max_traces_per_second: f64,
    pub max_request_content_length: usize,
    /// Spans longer than this are considered corrupt and dropped.
    pub max_span_duration: Duration,
    pub statsd_host: String,
    pub statsd_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: "unknown-host".to_string(),
            default_env: "none".to_string(),
            receiver_host: "localhost".to_string(),
            receiver_port: DEFAULT_RECEIVER_PORT,
            connection_limit: DEFAULT_CONNECTION_LIMIT,
            bucket_interval: Duration::from_secs(DEFAULT_BUCKET_INTERVAL_SECS),
            oldest_span_cutoff: Duration::from_secs(DEFAULT_OLDEST_SPAN_CUTOFF_SECS),
            extra_aggregators: Vec::new(),
            extra_sample_rate: 1.0,
            max_traces_per_second: DEFAULT_MAX_TRACES_PER_SECOND,
            max_request_content_length: DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            max_span_duration: Duration::from_secs(DEFAULT_MAX_SPAN_DURATION_SECS),
            statsd_host: "localhost".to_string(),
            statsd_port: DEFAULT_STATSD_PORT,
        }
    }
}

impl Config {
    /// Builds the configuration from the environment and validates it.
    pub fn from_env() -> Result<Config> {
        let defaults = Config::default();

        let hostname = env::var("DD_HOSTNAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or(defaults.hostname);

        let config = Config {
            hostname,
            default_env: env_string("DD_ENV", defaults.default_env),
            receiver_host: env_string("DD_RECEIVER_HOST", defaults.receiver_host),
            receiver_port: env_parse("DD_APM_RECEIVER_PORT", defaults.receiver_port)?,
            connection_limit: env_parse("DD_CONNECTION_LIMIT", defaults.connection_limit)?,
            bucket_interval: Duration::from_secs(env_parse(
                "DD_BUCKET_INTERVAL_SECONDS",
                DEFAULT_BUCKET_INTERVAL_SECS,
            )?),
            oldest_span_cutoff: Duration::from_secs(env_parse(
                "DD_OLDEST_SPAN_CUTOFF_SECONDS",
                DEFAULT_OLDEST_SPAN_CUTOFF_SECS,
            )?),
            extra_aggregators: env::var("DD_EXTRA_AGGREGATORS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            extra_sample_rate: env_parse("DD_EXTRA_SAMPLE_RATE", defaults.extra_sample_rate)?,
            max_traces_per_second: env_parse(
                "DD_MAX_TRACES_PER_SECOND",
                defaults.max_traces_per_second,
            )?,
            max_request_content_length: env_parse(
                "DD_MAX_REQUEST_CONTENT_LENGTH",
                defaults.max_request_content_length,
            )?,
            max_span_duration: Duration::from_secs(env_parse(
                "DD_MAX_SPAN_DURATION_SECONDS",
                DEFAULT_MAX_SPAN_DURATION_SECS,
            )?),
            statsd_host: env_string("DD_DOGSTATSD_HOST", defaults.statsd_host),
            statsd_port: env_parse("DD_DOGSTATSD_PORT", defaults.statsd_port)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Misconfiguration is fatal at startup; nothing here is recoverable.
    pub fn validate(&self) -> Result<()> {
        if self.receiver_port == 0 {
            bail!("receiver port must be nonzero");
        }
        if self.connection_limit == 0 {
            bail!("connection limit must be nonzero");
        }
        if self.bucket_interval.is_zero() {
            bail!("bucket interval must be nonzero");
        }
        if !(0.0..=1.0).contains(&self.extra_sample_rate) {
            bail!(
                "extra sample rate must be within [0, 1], got {}",
                self.extra_sample_rate
            );
        }
        if self.max_traces_per_second < 0.0 {
            bail!(
                "max traces per second must not be negative, got {}",
                self.max_traces_per_second
            );
        }
        Ok(())
    }

    pub fn oldest_span_cutoff_ns(&self) -> i64 {
        self.oldest_span_cutoff.as_nanos() as i64
    }

    pub fn max_span_duration_ns(&self) -> i64 {
        self.max_span_duration.as_nanos() as i64
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => match raw.parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => bail!("invalid value {raw:?} for {key}"),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults() {
        for key in [
            "DD_ENV",
            "DD_APM_RECEIVER_PORT",
            "DD_BUCKET_INTERVAL_SECONDS",
            "DD_EXTRA_AGGREGATORS",
            "DD_EXTRA_SAMPLE_RATE",
        ] {
            env::remove_var(key);
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.receiver_host, "localhost");
        assert_eq!(config.receiver_port, 7777);
        assert_eq!(config.connection_limit, 2_000);
        assert_eq!(config.bucket_interval, Duration::from_secs(5));
        assert_eq!(config.oldest_span_cutoff, Duration::from_secs(30));
        assert_eq!(config.extra_sample_rate, 1.0);
        assert_eq!(config.statsd_port, 8125);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("DD_APM_RECEIVER_PORT", "8126");
        env::set_var("DD_BUCKET_INTERVAL_SECONDS", "10");
        env::set_var("DD_EXTRA_AGGREGATORS", "resource, error");
        env::set_var("DD_EXTRA_SAMPLE_RATE", "0.33");

        let config = Config::from_env().unwrap();
        assert_eq!(config.receiver_port, 8126);
        assert_eq!(config.bucket_interval, Duration::from_secs(10));
        assert_eq!(
            config.extra_aggregators,
            vec!["resource".to_string(), "error".to_string()]
        );
        assert_eq!(config.extra_sample_rate, 0.33);

        for key in [
            "DD_APM_RECEIVER_PORT",
            "DD_BUCKET_INTERVAL_SECONDS",
            "DD_EXTRA_AGGREGATORS",
            "DD_EXTRA_SAMPLE_RATE",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_invalid_sample_rate_rejected() {
        env::set_var("DD_EXTRA_SAMPLE_RATE", "1.5");
        assert!(Config::from_env().is_err());
        env::remove_var("DD_EXTRA_SAMPLE_RATE");
    }

    #[test]
    #[serial]
    fn test_unparsable_value_rejected() {
        env::set_var("DD_APM_RECEIVER_PORT", "not-a-port");
        assert!(Config::from_env().is_err());
        env::remove_var("DD_APM_RECEIVER_PORT");
    }

    #[test]
    fn test_validate_zero_bucket_interval() {
        let config = Config {
            bucket_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
