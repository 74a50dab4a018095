//! Rule handlers: what happens once a rule has matched.

use crate::body::{encode, CodecError, Encoding};
use crate::capture::{CompletedRequest, Headers};
use base64::Engine;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

/// Description of a response to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_message: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// Serialize `value` as the body and set `content-type: application/json`.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.headers.set("content-type", "application/json");
        self.body = Bytes::from(value.to_string());
        self
    }

    /// Encode `body` and set the matching `content-encoding` header.
    pub fn with_encoded_body(mut self, body: &[u8], encoding: Encoding) -> Result<Self, CodecError> {
        self.body = encode(body, encoding)?;
        match encoding.header_value() {
            Some(value) => self.headers.set("content-encoding", value),
            None => {
                self.headers.remove("content-encoding");
            }
        }
        Ok(self)
    }
}

/// Where passthrough traffic is sent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughOptions {
    /// Origin (`scheme://host[:port]`) replacing the request's own. Required
    /// for requests sent directly to the server rather than through it as a proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<String>,
}

pub type CallbackFuture = BoxFuture<'static, anyhow::Result<Reply>>;

/// User-supplied function producing a reply for a captured request
#[derive(Clone)]
pub struct Callback(Arc<dyn Fn(Arc<CompletedRequest>) -> CallbackFuture + Send + Sync>);

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<CompletedRequest>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
    {
        Callback(Arc::new(move |request| Box::pin(f(request))))
    }

    pub fn call(&self, request: Arc<CompletedRequest>) -> CallbackFuture {
        (self.0)(request)
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

/// Handler variants
#[derive(Debug, Clone)]
pub enum Handler {
    /// Fixed response
    StaticReply(Reply),
    /// Forward upstream and relay the response verbatim
    Passthrough(PassthroughOptions),
    /// Run a callback to build the response
    Callback(Callback),
}

impl Handler {
    pub fn explain(&self) -> String {
        match self {
            Handler::StaticReply(reply) => format!("reply with status {}", reply.status),
            Handler::Passthrough(PassthroughOptions { forward_to: Some(to) }) => {
                format!("forward to {to}")
            }
            Handler::Passthrough(_) => "pass through to the original host".to_string(),
            Handler::Callback(_) => "respond using a callback".to_string(),
        }
    }
}

/// Serializable handler description used on the control protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HandlerData {
    Reply { reply: Reply },
    #[serde(rename_all = "camelCase")]
    Passthrough { options: PassthroughOptions },
    /// Callback executed by the remote client that registered it
    #[serde(rename_all = "camelCase")]
    Callback { callback_id: String },
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::decode;

    #[test]
    fn test_reply_builder() {
        let reply = Reply::new(200)
            .with_body("Mock response")
            .with_header("x-extra-header", "present");
        assert_eq!(reply.status, 200);
        assert_eq!(reply.headers.get("X-Extra-Header"), Some("present"));
        assert_eq!(&reply.body[..], b"Mock response");
    }

    #[test]
    fn test_reply_with_gzip_body() {
        let reply = Reply::new(200)
            .with_encoded_body(b"Mock response", Encoding::Gzip)
            .unwrap();
        assert_eq!(reply.headers.get("content-encoding"), Some("gzip"));
        let decoded = decode(&reply.body, Some("gzip")).unwrap();
        assert_eq!(&decoded[..], b"Mock response");
    }

    #[test]
    fn test_reply_json() {
        let reply = Reply::new(201).with_json(&serde_json::json!({"ok": true}));
        assert_eq!(reply.headers.get("content-type"), Some("application/json"));
        assert_eq!(&reply.body[..], br#"{"ok":true}"#);
    }

    #[test]
    fn test_handler_data_wire_shape() {
        let data = HandlerData::Reply {
            reply: Reply::new(200).with_body(vec![0u8, 1, 2]),
        };
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["type"], "reply");
        assert_eq!(json["reply"]["body"], "AAEC");

        let back: HandlerData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);

        let cb = HandlerData::Callback {
            callback_id: "cb-1".to_string(),
        };
        assert_eq!(serde_json::to_value(&cb).unwrap()["callbackId"], "cb-1");
    }

    #[tokio::test]
    async fn test_callback_invocation() {
        let callback = Callback::new(|req: Arc<CompletedRequest>| async move {
            Ok(Reply::new(200).with_body(req.method.clone()))
        });
        let request = Arc::new(CompletedRequest {
            id: "1".to_string(),
            protocol: crate::capture::Protocol::Http,
            method: "PATCH".to_string(),
            url: "http://h/".to_string(),
            path: "/".to_string(),
            hostname: "h".to_string(),
            normalized_url: "http://h/".to_string(),
            headers: Headers::new(),
            remote_address: None,
            timestamp: chrono::Utc::now(),
            body: crate::body::CapturedBody::new(Bytes::new(), None),
        });
        let reply = callback.call(request).await.unwrap();
        assert_eq!(&reply.body[..], b"PATCH");
    }
}
