//! Captured request and response records.
//!
//! These are the immutable snapshots handed to subscribers. They serialize to
//! the record shape used on the control protocol so a remote client sees the
//! same data as an in-process subscriber.

use crate::body::CapturedBody;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Headers
// ============================================================================

/// Ordered header multimap with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Remove all values for `name`, returning whether any existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before != self.0.len()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from a hyper header map. Non-UTF-8 values are decoded lossily.
    pub fn from_header_map(map: &hyper::HeaderMap) -> Self {
        Self(
            map.iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// ============================================================================
// Captured records
// ============================================================================

/// Protocol a request arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// A fully received request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRequest {
    /// Correlation id shared with the matching [`CompletedResponse`]
    pub id: String,
    pub protocol: Protocol,
    pub method: String,
    /// Absolute URL, including the query string
    pub url: String,
    /// Request target as sent on the request line for direct requests (path and query)
    pub path: String,
    pub hostname: String,
    /// URL with the query stripped, used for matching
    pub normalized_url: String,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: CapturedBody,
}

impl CompletedRequest {
    /// Query string without the leading `?`, if present.
    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q.split('#').next().unwrap_or(q))
    }
}

/// Kind and message of an error that shaped a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    UnmatchedRequest,
    HandlerError,
    PassthroughError,
}

/// A response as it was written back to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedResponse {
    /// Correlation id of the originating [`CompletedRequest`]
    pub id: String,
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub body: CapturedBody,
    /// Milliseconds between capture of the request and completion of the response
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("X-Extra-Header", "present");
        headers.append("set-cookie", "a=1");
        headers.append("Set-Cookie", "b=2");

        assert_eq!(headers.get("x-extra-header"), Some("present"));
        assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(headers.get_all("set-cookie").collect::<Vec<_>>(), vec!["a=1", "b=2"]);
        assert!(headers.get("missing").is_none());
    }

    #[test]
    fn test_headers_keep_insertion_order() {
        let headers: Headers = vec![("b", "2"), ("a", "1"), ("c", "3")].into_iter().collect();
        let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_headers_set_replaces() {
        let mut headers = Headers::new();
        headers.append("Content-Length", "1");
        headers.append("content-length", "2");
        headers.set("content-length", "3");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Content-Length"), Some("3"));
        assert!(headers.remove("CONTENT-LENGTH"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_request_record_shape() {
        let request = CompletedRequest {
            id: "abc".to_string(),
            protocol: Protocol::Http,
            method: "POST".to_string(),
            url: "http://localhost:8000/mocked-endpoint?a=1".to_string(),
            path: "/mocked-endpoint?a=1".to_string(),
            hostname: "localhost".to_string(),
            normalized_url: "http://localhost:8000/mocked-endpoint".to_string(),
            headers: vec![("host", "localhost:8000")].into_iter().collect(),
            remote_address: None,
            timestamp: Utc::now(),
            body: CapturedBody::new(Bytes::from_static(b"body-text"), None),
        };

        assert_eq!(request.query(), Some("a=1"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], "abc");
        assert_eq!(json["protocol"], "http");
        assert_eq!(json["normalizedUrl"], "http://localhost:8000/mocked-endpoint");
        assert_eq!(json["headers"][0][0], "host");
        assert!(json.get("remoteAddress").is_none());

        let back: CompletedRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.body.text(), Some("body-text"));
    }

    #[test]
    fn test_error_kind_wire_names() {
        let info = ErrorInfo {
            kind: ErrorKind::UnmatchedRequest,
            message: "no rule".to_string(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "unmatched-request");
    }
}
