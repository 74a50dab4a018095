//! Request matchers.
//!
//! A rule holds a list of matchers, all of which must accept a request for
//! the rule to apply. Matchers are serializable so rules can be registered
//! over the control protocol; they are compiled once when the rule is added.

use super::string_matcher::{CompiledStringMatcher, StringMatcher};
use crate::capture::CompletedRequest;
use crate::normalize::{normalize, parse_query, path_of};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A single request predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Matcher {
    /// HTTP method, compared case-insensitively
    Method { method: String },
    /// Normalized URL. Patterns starting with `/` compare against the path only.
    Url { url: String },
    /// Regex over the full normalized URL
    UrlMatches { pattern: String },
    /// Hostname, compared case-insensitively
    Hostname { hostname: String },
    /// Header value (names are case-insensitive)
    Header { name: String, value: StringMatcher },
    /// Decoded query parameter
    Query { name: String, value: StringMatcher },
    /// Decoded body text
    Body { body: StringMatcher },
    /// Decoded body parsed as JSON, compared exactly
    JsonBody { json: Value },
    /// Decoded body parsed as JSON, containing at least the given fields
    JsonBodyIncluding { json: Value },
}

impl Matcher {
    pub fn method(method: impl Into<String>) -> Self {
        Matcher::Method { method: method.into() }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Matcher::Url { url: url.into() }
    }

    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher::Header {
            name: name.into(),
            value: StringMatcher::Equals(value.into()),
        }
    }

    pub fn query(name: impl Into<String>, value: impl Into<String>) -> Self {
        Matcher::Query {
            name: name.into(),
            value: StringMatcher::Equals(value.into()),
        }
    }

    /// Human-readable description, used for unmatched-request diagnostics.
    pub fn explain(&self) -> String {
        match self {
            Matcher::Method { method } => format!("{} requests", method.to_uppercase()),
            Matcher::Url { url } => format!("for {url}"),
            Matcher::UrlMatches { pattern } => format!("for URLs matching /{pattern}/"),
            Matcher::Hostname { hostname } => format!("to host {hostname}"),
            Matcher::Header { name, value } => format!("with header {name:?} {}", value.explain()),
            Matcher::Query { name, value } => {
                format!("with query parameter {name:?} {}", value.explain())
            }
            Matcher::Body { body } => format!("with body {}", body.explain()),
            Matcher::JsonBody { json } => format!("with JSON body {json}"),
            Matcher::JsonBodyIncluding { json } => format!("with JSON body including {json}"),
        }
    }
}

/// Matcher compiled for runtime evaluation
#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    Method(String),
    PathEquals(String),
    UrlEquals(String),
    UrlMatches(Arc<Regex>),
    Hostname(String),
    Header(String, CompiledStringMatcher),
    Query(String, CompiledStringMatcher),
    Body(CompiledStringMatcher),
    JsonBody(Value),
    JsonBodyIncluding(Value),
}

impl CompiledMatcher {
    pub fn compile(matcher: &Matcher) -> Result<Self, regex::Error> {
        Ok(match matcher {
            Matcher::Method { method } => CompiledMatcher::Method(method.to_uppercase()),
            Matcher::Url { url } => {
                let normalized = normalize(url);
                if normalized.starts_with('/') {
                    CompiledMatcher::PathEquals(normalized)
                } else {
                    CompiledMatcher::UrlEquals(normalized)
                }
            }
            Matcher::UrlMatches { pattern } => {
                CompiledMatcher::UrlMatches(Arc::new(Regex::new(pattern)?))
            }
            Matcher::Hostname { hostname } => CompiledMatcher::Hostname(hostname.to_lowercase()),
            Matcher::Header { name, value } => {
                CompiledMatcher::Header(name.to_lowercase(), CompiledStringMatcher::compile(value)?)
            }
            Matcher::Query { name, value } => {
                CompiledMatcher::Query(name.clone(), CompiledStringMatcher::compile(value)?)
            }
            Matcher::Body { body } => CompiledMatcher::Body(CompiledStringMatcher::compile(body)?),
            Matcher::JsonBody { json } => CompiledMatcher::JsonBody(json.clone()),
            Matcher::JsonBodyIncluding { json } => CompiledMatcher::JsonBodyIncluding(json.clone()),
        })
    }

    /// Evaluate against a captured request. Pure; reads only cached views.
    pub fn matches(&self, request: &CompletedRequest) -> bool {
        match self {
            CompiledMatcher::Method(method) => request.method.eq_ignore_ascii_case(method),
            CompiledMatcher::PathEquals(path) => path_of(&request.normalized_url) == path.as_str(),
            CompiledMatcher::UrlEquals(url) => url_equals(&request.normalized_url, url),
            CompiledMatcher::UrlMatches(regex) => regex.is_match(&request.normalized_url),
            CompiledMatcher::Hostname(host) => request.hostname.eq_ignore_ascii_case(host),
            CompiledMatcher::Header(name, matcher) => {
                matcher.matches(request.headers.get(name))
            }
            CompiledMatcher::Query(name, matcher) => {
                let pairs = request.query().map(parse_query).unwrap_or_default();
                let value = pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
                matcher.matches(value)
            }
            CompiledMatcher::Body(matcher) => match request.body.text() {
                Some(text) => matcher.matches(Some(text)),
                None => false,
            },
            CompiledMatcher::JsonBody(expected) => {
                request.body.json().map(|actual| actual == expected).unwrap_or(false)
            }
            CompiledMatcher::JsonBodyIncluding(expected) => request
                .body
                .json()
                .map(|actual| json_includes(actual, expected))
                .unwrap_or(false),
        }
    }
}

/// Absolute URL comparison; a pattern without a scheme matches any scheme.
fn url_equals(actual: &str, pattern: &str) -> bool {
    if pattern.contains("://") {
        return actual == pattern;
    }
    match actual.split_once("://") {
        Some((_, rest)) => rest == pattern,
        None => actual == pattern,
    }
}

/// Whether `actual` contains everything in `expected`.
///
/// Objects match when every expected key matches recursively; arrays when
/// every expected element is included by some actual element.
pub fn json_includes(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => e
            .iter()
            .all(|(k, ev)| a.get(k).is_some_and(|av| json_includes(av, ev))),
        (Value::Array(a), Value::Array(e)) => {
            e.iter().all(|ev| a.iter().any(|av| json_includes(av, ev)))
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CapturedBody;
    use crate::capture::{Headers, Protocol};
    use bytes::Bytes;
    use serde_json::json;

    fn request(method: &str, url: &str, body: &str) -> CompletedRequest {
        let hostname = url
            .split("://")
            .nth(1)
            .and_then(|r| r.split(['/', ':']).next())
            .unwrap_or_default()
            .to_string();
        CompletedRequest {
            id: "id".to_string(),
            protocol: Protocol::Http,
            method: method.to_string(),
            url: url.to_string(),
            path: path_of(url).to_string(),
            hostname,
            normalized_url: normalize(url),
            headers: vec![("content-type", "application/json"), ("x-token", "abc")]
                .into_iter()
                .collect::<Headers>(),
            remote_address: None,
            timestamp: chrono::Utc::now(),
            body: CapturedBody::new(Bytes::from(body.to_string()), None),
        }
    }

    fn compile(m: Matcher) -> CompiledMatcher {
        CompiledMatcher::compile(&m).unwrap()
    }

    #[test]
    fn test_method_matcher() {
        let m = compile(Matcher::method("get"));
        assert!(m.matches(&request("GET", "http://localhost:8000/x", "")));
        assert!(!m.matches(&request("POST", "http://localhost:8000/x", "")));
    }

    #[test]
    fn test_path_matcher_ignores_query() {
        let m = compile(Matcher::url("/mocked-endpoint"));
        assert!(m.matches(&request("GET", "http://localhost:8000/mocked-endpoint?a=1", "")));
        assert!(!m.matches(&request("GET", "http://localhost:8000/mocked-endpoint/", "")));
        assert!(!m.matches(&request("GET", "http://localhost:8000/other", "")));
    }

    #[test]
    fn test_absolute_url_matcher() {
        let m = compile(Matcher::url("http://example.com/api?ignored=1"));
        assert!(m.matches(&request("GET", "http://example.com/api?x=2", "")));
        assert!(!m.matches(&request("GET", "https://example.com/api", "")));

        let schemeless = compile(Matcher::url("example.com/api"));
        assert!(schemeless.matches(&request("GET", "https://example.com/api", "")));
    }

    #[test]
    fn test_url_regex_matcher() {
        let m = compile(Matcher::UrlMatches {
            pattern: r"/users/\d+$".to_string(),
        });
        assert!(m.matches(&request("GET", "http://h/users/42?full=true", "")));
        assert!(!m.matches(&request("GET", "http://h/users/me", "")));
    }

    #[test]
    fn test_header_matcher_name_case_insensitive() {
        let m = compile(Matcher::header("X-Token", "abc"));
        assert!(m.matches(&request("GET", "http://h/", "")));

        let absent = compile(Matcher::Header {
            name: "authorization".to_string(),
            value: StringMatcher::Exists(false),
        });
        assert!(absent.matches(&request("GET", "http://h/", "")));
    }

    #[test]
    fn test_query_matcher() {
        let m = compile(Matcher::query("q", "hello world"));
        assert!(m.matches(&request("GET", "http://h/search?q=hello%20world", "")));
        assert!(!m.matches(&request("GET", "http://h/search?q=other", "")));
        assert!(!m.matches(&request("GET", "http://h/search", "")));
    }

    #[test]
    fn test_body_matchers() {
        let req = request("POST", "http://h/", r#"{"user":{"name":"ann","tags":["a","b"]},"n":1}"#);

        assert!(compile(Matcher::Body {
            body: StringMatcher::Contains("ann".to_string())
        })
        .matches(&req));

        assert!(compile(Matcher::JsonBody {
            json: json!({"n": 1, "user": {"name": "ann", "tags": ["a", "b"]}})
        })
        .matches(&req));

        assert!(compile(Matcher::JsonBodyIncluding {
            json: json!({"user": {"tags": ["b"]}})
        })
        .matches(&req));

        assert!(!compile(Matcher::JsonBodyIncluding {
            json: json!({"user": {"name": "bob"}})
        })
        .matches(&req));

        let not_json = request("POST", "http://h/", "plain");
        assert!(!compile(Matcher::JsonBody { json: json!({}) }).matches(&not_json));
    }

    #[test]
    fn test_matching_is_repeatable() {
        let req = request("POST", "http://h/", r#"{"a":1}"#);
        let m = compile(Matcher::JsonBody { json: json!({"a": 1}) });
        assert!(m.matches(&req));
        assert!(m.matches(&req));
        assert_eq!(req.body.buffer(), &Bytes::from_static(br#"{"a":1}"#));
    }

    #[test]
    fn test_matcher_serde_and_explain() {
        let m: Matcher =
            serde_json::from_value(json!({"type": "header", "name": "x-a", "value": {"equals": "1"}}))
                .unwrap();
        assert_eq!(m, Matcher::header("x-a", "1"));
        assert_eq!(m.explain(), r#"with header "x-a" = "1""#);
        assert_eq!(Matcher::method("get").explain(), "GET requests");
        assert_eq!(Matcher::url("/x").explain(), "for /x");
    }
}
