//! Header names used by the pipeline.
//!
//! Snare's diagnostic headers are static `HeaderName`s.

use hyper::header::HeaderName;

pub static X_SNARE_UNMATCHED: HeaderName = HeaderName::from_static("x-snare-unmatched");
pub static X_SNARE_HANDLER_ERROR: HeaderName = HeaderName::from_static("x-snare-handler-error");
pub static X_SNARE_PASSTHROUGH_ERROR: HeaderName =
    HeaderName::from_static("x-snare-passthrough-error");

/// Connection-scoped headers that are never relayed between hops.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_header_names() {
        assert_eq!(X_SNARE_UNMATCHED.as_str(), "x-snare-unmatched");
        assert_eq!(X_SNARE_HANDLER_ERROR.as_str(), "x-snare-handler-error");
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-encoding"));
        assert!(!is_hop_by_hop("x-extra-header"));
    }
}
