// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resource canonicalization.
//!
//! Two SQL statements differing only in literal values, or two HTTP routes
//! differing only in path ids, must collapse to the same aggregation key.
//! Quantization is deterministic (identical input, byte-identical output)
//! and idempotent, so it can safely run again on an already-quantized span.

use crate::normalize::{truncate_utf8, MAX_RESOURCE_LEN};
use crate::span::Span;

/// Rewrites `span.resource` into its canonical, bounded-cardinality form.
pub fn quantize(span: &mut Span) {
    match span.span_type.as_str() {
        "sql" | "cassandra" | "db" => span.resource = quantize_sql(&span.resource),
        "http" | "web" => span.resource = quantize_http(&span.resource),
        _ => {}
    }
    truncate_utf8(&mut span.resource, MAX_RESOURCE_LEN);
}

const SQL_KEYWORDS: &[&str] = &[
    "all", "alter", "and", "as", "asc", "begin", "between", "by", "case", "commit", "create",
    "delete", "desc", "distinct", "drop", "else", "end", "exists", "from", "group", "having",
    "in", "index", "inner", "insert", "into", "is", "join", "left", "like", "limit", "not",
    "null", "offset", "on", "or", "order", "outer", "right", "rollback", "select", "set",
    "table", "then", "union", "update", "values", "when", "where",
];

#[derive(Debug, PartialEq)]
enum SqlToken {
    Word(String),
    Placeholder,
    Symbol(char),
}

/// Canonicalizes an SQL statement: literals become `?`, literal lists
/// collapse to a single `?`, whitespace collapses, keywords uppercase.
fn quantize_sql(query: &str) -> String {
    let tokens = collapse_placeholder_lists(tokenize_sql(query));

    let mut out = String::with_capacity(query.len());
    for token in &tokens {
        let piece = match token {
            SqlToken::Word(w) => w.as_str(),
            SqlToken::Placeholder => "?",
            SqlToken::Symbol(c) => {
                if matches!(*c, ',' | ';') {
                    // no space before separators
                    out.push(*c);
                    continue;
                }
                out.push_str(if out.is_empty() { "" } else { " " });
                out.push(*c);
                continue;
            }
        };
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(piece);
    }
    out
}

fn tokenize_sql(query: &str) -> Vec<SqlToken> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            consume_string_literal(&mut chars);
            tokens.push(SqlToken::Placeholder);
        } else if c == '?' {
            chars.next();
            tokens.push(SqlToken::Placeholder);
        } else if c.is_ascii_digit() {
            consume_number(&mut chars);
            tokens.push(SqlToken::Placeholder);
        } else if c.is_alphabetic() || matches!(c, '_' | '"' | '`') {
            tokens.push(SqlToken::Word(consume_word(&mut chars)));
        } else {
            chars.next();
            tokens.push(SqlToken::Symbol(c));
        }
    }
    tokens
}

fn consume_string_literal(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while let Some(c) = chars.next() {
        match c {
            // doubled quote escapes a quote
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
            }
            '\'' => return,
            '\\' => {
                chars.next();
            }
            _ => {}
        }
    }
}

fn consume_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    let mut prev = '0';
    while let Some(&c) = chars.peek() {
        let is_exponent_sign = matches!(c, '+' | '-') && matches!(prev, 'e' | 'E');
        if c.is_ascii_alphanumeric() || c == '.' || is_exponent_sign {
            prev = c;
            chars.next();
        } else {
            break;
        }
    }
}

fn consume_word(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '"' | '`') {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if SQL_KEYWORDS.contains(&word.to_ascii_lowercase().as_str()) {
        word.make_ascii_uppercase();
    }
    word
}

/// Collapses `?, ?, ?` runs (typically `IN` lists) into a single `?`.
fn collapse_placeholder_lists(tokens: Vec<SqlToken>) -> Vec<SqlToken> {
    let mut out: Vec<SqlToken> = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let drop = match tokens[i] {
            SqlToken::Placeholder => matches!(out.last(), Some(SqlToken::Placeholder)),
            SqlToken::Symbol(',') => {
                matches!(out.last(), Some(SqlToken::Placeholder))
                    && matches!(tokens.get(i + 1), Some(SqlToken::Placeholder))
            }
            _ => false,
        };
        if !drop {
            out.push(match &tokens[i] {
                SqlToken::Word(w) => SqlToken::Word(w.clone()),
                SqlToken::Placeholder => SqlToken::Placeholder,
                SqlToken::Symbol(c) => SqlToken::Symbol(*c),
            });
        }
        i += 1;
    }
    out
}

/// Canonicalizes a `METHOD /path` resource: path segments that look like
/// identifiers (numeric, long hex, UUID) become `?`.
fn quantize_http(resource: &str) -> String {
    let (method, path) = match resource.split_once(' ') {
        Some((m, p)) if p.starts_with('/') => (Some(m), p),
        _ if resource.starts_with('/') => (None, resource),
        _ => return resource.to_string(),
    };

    let quantized: Vec<&str> = path
        .split('/')
        .map(|seg| if looks_like_id(seg) { "?" } else { seg })
        .collect();
    let quantized = quantized.join("/");

    match method {
        Some(m) => format!("{m} {quantized}"),
        None => quantized,
    }
}

fn looks_like_id(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if segment.len() >= 16 && segment.bytes().all(|b| b.is_ascii_hexdigit()) {
        return true;
    }
    is_uuid(segment)
}

fn is_uuid(segment: &str) -> bool {
    if segment.len() != 36 {
        return false;
    }
    segment.bytes().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_span(resource: &str) -> Span {
        Span {
            trace_id: 1,
            span_id: 1,
            resource: resource.to_string(),
            span_type: "sql".to_string(),
            ..Span::default()
        }
    }

    fn http_span(resource: &str) -> Span {
        Span {
            trace_id: 1,
            span_id: 1,
            resource: resource.to_string(),
            span_type: "http".to_string(),
            ..Span::default()
        }
    }

    fn quantized(mut span: Span) -> String {
        quantize(&mut span);
        span.resource
    }

    #[test]
    fn test_sql_numeric_literals_collapse() {
        let a = quantized(sql_span("SELECT * FROM t WHERE id = 42"));
        let b = quantized(sql_span("SELECT * FROM t WHERE id = 43"));
        assert_eq!(a, b);
        assert_eq!(a, "SELECT * FROM t WHERE id = ?");
    }

    #[test]
    fn test_sql_string_literals_replaced() {
        assert_eq!(
            quantized(sql_span("select name from users where name = 'O''Brien'")),
            "SELECT name FROM users WHERE name = ?"
        );
    }

    #[test]
    fn test_sql_in_list_collapsed() {
        assert_eq!(
            quantized(sql_span("SELECT * FROM t WHERE id IN (1, 2, 3)")),
            "SELECT * FROM t WHERE id IN ( ? )"
        );
    }

    #[test]
    fn test_sql_whitespace_collapsed_keywords_uppercased() {
        assert_eq!(
            quantized(sql_span("select  *\n\tfrom t   where x = 1")),
            "SELECT * FROM t WHERE x = ?"
        );
    }

    #[test]
    fn test_sql_quantize_idempotent() {
        let once = quantized(sql_span("SELECT * FROM t WHERE id IN (1, 2, 3) AND name = 'x'"));
        let twice = quantized(sql_span(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_http_numeric_segment() {
        let a = quantized(http_span("GET /user/42"));
        let b = quantized(http_span("GET /user/43"));
        assert_eq!(a, b);
        assert_eq!(a, "GET /user/?");
    }

    #[test]
    fn test_http_uuid_and_hex_segments() {
        assert_eq!(
            quantized(http_span(
                "GET /object/deadbeef-dead-beef-dead-beefdeadbeef/child"
            )),
            "GET /object/?/child"
        );
        assert_eq!(
            quantized(http_span("GET /blob/0123456789abcdef0123")),
            "GET /blob/?"
        );
    }

    #[test]
    fn test_http_short_hex_kept() {
        // "cafe" is hex but too short to be an id.
        assert_eq!(quantized(http_span("GET /word/cafe")), "GET /word/cafe");
    }

    #[test]
    fn test_http_quantize_idempotent() {
        let once = quantized(http_span("GET /user/42/posts/77"));
        let twice = quantized(http_span(&once));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_http_non_route_resource_untouched() {
        assert_eq!(quantized(http_span("just-a-label")), "just-a-label");
    }

    #[test]
    fn test_other_types_length_bounded() {
        let mut span = Span {
            trace_id: 1,
            span_id: 1,
            resource: "x".repeat(MAX_RESOURCE_LEN + 100),
            span_type: "redis".to_string(),
            ..Span::default()
        };
        quantize(&mut span);
        assert_eq!(span.resource.len(), MAX_RESOURCE_LEN);
    }
}
