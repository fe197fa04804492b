// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Small HTTP helpers shared by the receiver handlers.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::http::{self, HeaderMap};
use hyper::{header, Response, StatusCode};
use tracing::error;

use crate::metrics::StatsClient;

pub type BoxedResponse = Response<Full<Bytes>>;

/// The body every accepted request gets.
pub const OK_BODY: &str = "OK\n";

pub fn ok_response() -> http::Result<BoxedResponse> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from_static(OK_BODY.as_bytes())))
}

pub fn not_found_response() -> http::Result<BoxedResponse> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::new()))
}

/// Logs the failure, bumps the receiver error counter with `code:` and
/// `err:` tags, and returns a short tag-style reason to the client.
pub fn error_response(
    status: StatusCode,
    reason: &str,
    stats_client: &dyn StatsClient,
    tags: &[String],
) -> http::Result<BoxedResponse> {
    error!(code = status.as_u16(), ?tags, "request error: {reason}");

    let mut error_tags = tags.to_vec();
    error_tags.push(format!("code:{}", status.as_u16()));
    error_tags.push(format!("err:{reason}"));
    stats_client.count("trace_agent.receiver.error", 1, &error_tags);

    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(format!("{reason}\n"))))
}

/// Checks a declared `Content-Length` against the body limit before the
/// body is read. Bodies without the header are bounded after collection.
pub fn content_length_exceeds(headers: &HeaderMap, max_content_length: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok())
        .is_some_and(|length| length > max_content_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopStatsClient;

    fn headers_with_content_length(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_ok_response_body() {
        let response = ok_response().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "unsupported-media-type",
            &NoopStatsClient,
            &[],
        )
        .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn test_content_length_checks() {
        assert!(content_length_exceeds(
            &headers_with_content_length("1000"),
            100
        ));
        assert!(!content_length_exceeds(
            &headers_with_content_length("50"),
            100
        ));
        // missing or garbage headers defer to the post-read check
        assert!(!content_length_exceeds(&HeaderMap::new(), 100));
        assert!(!content_length_exceeds(
            &headers_with_content_length("not-a-number"),
            100
        ));
    }
}
