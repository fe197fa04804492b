// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statsd-shaped internal telemetry.
//!
//! Components receive an injected [`StatsClient`] instead of reaching for a
//! process-wide singleton. The UDP implementation writes dogstatsd text
//! datagrams (`name:value|type|#tag,tag`); delivery is fire-and-forget and
//! a lost datagram is never an error.

use std::io;
use std::net::UdpSocket;

pub trait StatsClient: Send + Sync {
    fn count(&self, name: &str, value: i64, tags: &[String]);
    fn histogram(&self, name: &str, value: f64, tags: &[String]);
}

/// Swallows every metric. Used when statsd is not configured and in tests.
pub struct NoopStatsClient;

impl StatsClient for NoopStatsClient {
    fn count(&self, _name: &str, _value: i64, _tags: &[String]) {}
    fn histogram(&self, _name: &str, _value: f64, _tags: &[String]) {}
}

/// Sends dogstatsd datagrams over UDP.
pub struct UdpStatsClient {
    socket: UdpSocket,
}

impl UdpStatsClient {
    pub fn new(host: &str, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((host, port))?;
        socket.set_nonblocking(true)?;
        Ok(UdpStatsClient { socket })
    }

    fn send(&self, datagram: String) {
        // dropped datagrams are fine, never block or fail the pipeline
        let _ = self.socket.send(datagram.as_bytes());
    }
}

impl StatsClient for UdpStatsClient {
    fn count(&self, name: &str, value: i64, tags: &[String]) {
        self.send(format_datagram(name, &value.to_string(), 'c', tags));
    }

    fn histogram(&self, name: &str, value: f64, tags: &[String]) {
        self.send(format_datagram(name, &value.to_string(), 'h', tags));
    }
}

fn format_datagram(name: &str, value: &str, kind: char, tags: &[String]) -> String {
    if tags.is_empty() {
        format!("{name}:{value}|{kind}")
    } else {
        format!("{name}:{value}|{kind}|#{}", tags.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_without_tags() {
        assert_eq!(
            format_datagram("trace_agent.receiver.span", "5", 'c', &[]),
            "trace_agent.receiver.span:5|c"
        );
    }

    #[test]
    fn test_datagram_with_tags() {
        let tags = vec!["code:415".to_string(), "err:unsupported-media-type".to_string()];
        assert_eq!(
            format_datagram("trace_agent.receiver.error", "1", 'c', &tags),
            "trace_agent.receiver.error:1|c|#code:415,err:unsupported-media-type"
        );
    }
}
