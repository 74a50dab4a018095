//! Cached decoded views over captured bodies.

use super::codec::decode;
use base64::Engine;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

/// Error returned when a requested body view cannot be produced
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Body could not be decoded as {encoding}")]
    Encoding { encoding: String },
    #[error("Body is not valid UTF-8")]
    NotText,
    #[error("Body is not valid JSON: {0}")]
    InvalidJson(String),
}

/// Raw body bytes plus lazily computed, cached decoded views.
///
/// The raw buffer is never modified; each view is computed on first access
/// and every later call returns the cached result.
pub struct CapturedBody {
    buffer: Bytes,
    content_encoding: Option<String>,
    decoded: OnceCell<Option<Bytes>>,
    text: OnceCell<Option<String>>,
    json: OnceCell<Result<serde_json::Value, DecodeError>>,
}

impl CapturedBody {
    pub fn new(buffer: Bytes, content_encoding: Option<&str>) -> Self {
        Self {
            buffer,
            content_encoding: content_encoding.map(str::to_string),
            decoded: OnceCell::new(),
            text: OnceCell::new(),
            json: OnceCell::new(),
        }
    }

    /// Raw bytes as they crossed the wire.
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes with the content-encoding reversed, `None` if decoding failed.
    pub fn decoded_buffer(&self) -> Option<&Bytes> {
        self.decoded
            .get_or_init(|| match decode(&self.buffer, self.content_encoding()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    debug!("Body decode failed: {}", e);
                    None
                }
            })
            .as_ref()
    }

    /// Decoded body as UTF-8 text, `None` if it can't be decoded.
    pub fn text(&self) -> Option<&str> {
        self.text
            .get_or_init(|| {
                self.decoded_buffer()
                    .and_then(|bytes| std::str::from_utf8(bytes).ok())
                    .map(str::to_string)
            })
            .as_deref()
    }

    /// Decoded body parsed as JSON.
    pub fn json(&self) -> Result<&serde_json::Value, DecodeError> {
        self.json
            .get_or_init(|| {
                if self.decoded_buffer().is_none() {
                    return Err(DecodeError::Encoding {
                        encoding: self.content_encoding.clone().unwrap_or_default(),
                    });
                }
                let text = self.text().ok_or(DecodeError::NotText)?;
                serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl Clone for CapturedBody {
    fn clone(&self) -> Self {
        Self::new(self.buffer.clone(), self.content_encoding())
    }
}

impl std::fmt::Debug for CapturedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedBody")
            .field("len", &self.buffer.len())
            .field("content_encoding", &self.content_encoding)
            .finish()
    }
}

/// Wire form: the raw buffer as base64. Views are recomputed by the receiver.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBody {
    buffer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_encoding: Option<String>,
}

impl Serialize for CapturedBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireBody {
            buffer: base64::engine::general_purpose::STANDARD.encode(&self.buffer),
            content_encoding: self.content_encoding.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CapturedBody {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireBody::deserialize(deserializer)?;
        let buffer = base64::engine::general_purpose::STANDARD
            .decode(&wire.buffer)
            .map_err(serde::de::Error::custom)?;
        Ok(Self::new(Bytes::from(buffer), wire.content_encoding.as_deref()))
    }
}
