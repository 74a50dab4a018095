//! Content-encoding codec.
//!
//! Decodes captured bodies according to their `Content-Encoding` header and
//! encodes synthesized bodies for fixtures that need to go out compressed.

use bytes::Bytes;
use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::debug;

/// Errors produced while reversing a content-encoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to decode {encoding} body: {source}")]
    Decode {
        encoding: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode body: {0}")]
    Encode(#[source] std::io::Error),
}

/// Encodings supported for synthesized responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
}

impl Encoding {
    /// Value for the `Content-Encoding` header, if any.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
        }
    }
}

/// Reverse the content-encoding of a body.
///
/// A comma-separated header lists codings in the order they were applied,
/// so they are undone right to left. Missing, `identity` and unrecognized
/// tokens leave the bytes untouched.
pub fn decode(body: &Bytes, content_encoding: Option<&str>) -> Result<Bytes, CodecError> {
    let Some(header) = content_encoding else {
        return Ok(body.clone());
    };

    let mut current = body.clone();
    for token in header.rsplit(',') {
        let token = token.trim().to_ascii_lowercase();
        current = match token.as_str() {
            "gzip" | "x-gzip" => Bytes::from(read_all(MultiGzDecoder::new(&current[..]), &token)?),
            "deflate" => Bytes::from(inflate(&current)?),
            "" | "identity" => current,
            other => {
                debug!("Leaving body with unsupported content-encoding '{}' as-is", other);
                current
            }
        };
    }
    Ok(current)
}

/// `deflate` is ambiguous on the wire: try zlib-wrapped first, then raw.
fn inflate(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    match read_all(ZlibDecoder::new(body), "deflate") {
        Ok(decoded) => Ok(decoded),
        Err(_) => read_all(DeflateDecoder::new(body), "deflate"),
    }
}

fn read_all(mut reader: impl Read, encoding: &str) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader
        .read_to_end(&mut out)
        .map_err(|source| CodecError::Decode {
            encoding: encoding.to_string(),
            source,
        })?;
    Ok(out)
}

/// Encode a body for sending.
pub fn encode(body: &[u8], encoding: Encoding) -> Result<Bytes, CodecError> {
    match encoding {
        Encoding::Identity => Ok(Bytes::copy_from_slice(body)),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(body.len()), Compression::default());
            encoder.write_all(body).map_err(CodecError::Encode)?;
            encoder.finish().map(Bytes::from).map_err(CodecError::Encode)
        }
    }
}
