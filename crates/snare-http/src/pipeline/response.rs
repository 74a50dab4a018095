//! Turning reply descriptions into hyper responses.

use super::headers::is_hop_by_hop;
use crate::capture::Headers;
use crate::rules::Reply;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("Invalid status code {0}")]
    InvalidStatus(u16),

    #[error("Invalid header {name:?}")]
    InvalidHeader { name: String },
}

/// A validated response, ready to be captured and written.
#[derive(Debug, Clone)]
pub struct PreparedResponse {
    pub status: StatusCode,
    pub status_message: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl PreparedResponse {
    /// Validate `reply` and fix up its framing headers.
    ///
    /// Hop-by-hop headers are dropped. `content-length` is recomputed from the
    /// body, except for bodiless statuses (where it is removed) and replies to
    /// `HEAD` (where a handler-provided value is kept). Neither carries a body.
    pub fn from_reply(reply: Reply, head_request: bool) -> Result<Self, ReplyError> {
        let status =
            StatusCode::from_u16(reply.status).map_err(|_| ReplyError::InvalidStatus(reply.status))?;

        let mut headers = Headers::new();
        for (name, value) in reply.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            if HeaderName::from_bytes(name.as_bytes()).is_err()
                || HeaderValue::from_str(value).is_err()
            {
                return Err(ReplyError::InvalidHeader {
                    name: name.to_string(),
                });
            }
            headers.append(name, value);
        }

        if status_has_no_body(status) {
            headers.remove("content-length");
        } else if !(head_request && headers.contains("content-length")) {
            headers.set("content-length", reply.body.len().to_string());
        }

        let status_message = reply
            .status_message
            .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());

        let body = if head_request || status_has_no_body(status) {
            Bytes::new()
        } else {
            reply.body
        };

        Ok(Self {
            status,
            status_message,
            headers,
            body,
        })
    }

    /// A `text/plain` response produced by Snare itself.
    pub fn plain_text(status: StatusCode, text: String) -> Self {
        let body = Bytes::from(text);
        let headers: Headers = [
            ("content-type", "text/plain; charset=utf-8".to_string()),
            ("content-length", body.len().to_string()),
        ]
        .into_iter()
        .collect();
        Self {
            status,
            status_message: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        }
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = build_response_with_headers(self.status, self.headers.iter(), self.body);
        if Some(self.status_message.as_str()) != self.status.canonical_reason() {
            if let Ok(reason) = hyper::ext::ReasonPhrase::try_from(self.status_message.into_bytes()) {
                response.extensions_mut().insert(reason);
            }
        }
        response
    }
}

fn status_has_no_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Build an HTTP response with the given status and body.
pub fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}

/// Build an HTTP response with headers.
///
/// Falls back to a minimal response if the builder rejects its input.
pub fn build_response_with_headers(
    status: StatusCode,
    headers: impl IntoIterator<Item = (impl AsRef<str>, impl AsRef<str>)>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(status);
    for (key, value) in headers {
        builder = builder.header(key.as_ref(), value.as_ref());
    }
    builder
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("Internal Server Error"))))
}
