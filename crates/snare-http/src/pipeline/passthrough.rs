//! Forwarding requests upstream for passthrough rules.

use super::headers::is_hop_by_hop;
use crate::capture::{CompletedRequest, Headers};
use crate::config::PassthroughConfig;
use crate::normalize::split_origin;
use crate::rules::{PassthroughOptions, Reply};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PassthroughError {
    /// The request was sent to the server directly, so there is no
    /// original host to pass it through to.
    #[error("Cannot pass through a request sent directly to the mock server; use a forwarding target")]
    NoTarget,

    #[error("Invalid forwarding target '{0}'")]
    InvalidTarget(String),

    #[error("Failed to build upstream client: {0}")]
    Client(reqwest::Error),

    #[error("Upstream request to {url} failed: {source}")]
    Upstream {
        url: String,
        source: reqwest::Error,
    },
}

impl PassthroughError {
    /// Whether the failure lies in the rule rather than in the upstream.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, PassthroughError::NoTarget | PassthroughError::InvalidTarget(_))
    }
}

/// Upstream HTTP client shared by all passthrough rules of one server
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: &PassthroughConfig) -> Result<Self, PassthroughError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.ignore_host_certificate_errors)
            .build()
            .map_err(PassthroughError::Client)?;
        Ok(Self { client })
    }

    /// Upstream URL for `request`.
    ///
    /// `proxied` is true when the request reached us as proxy traffic
    /// (absolute-form target or inside a CONNECT tunnel).
    pub fn target_url(
        request: &CompletedRequest,
        options: &PassthroughOptions,
        proxied: bool,
    ) -> Result<String, PassthroughError> {
        match options.forward_to {
            Some(ref base) => {
                let origin = match split_origin(base) {
                    Some((origin, "")) | Some((origin, "/")) => origin,
                    _ => return Err(PassthroughError::InvalidTarget(base.clone())),
                };
                let rest = split_origin(&request.url).map(|(_, rest)| rest).unwrap_or("/");
                Ok(format!("{origin}{rest}"))
            }
            None if proxied => Ok(request.url.clone()),
            None => Err(PassthroughError::NoTarget),
        }
    }

    /// Send `request` to `url` and relay the upstream response verbatim.
    pub async fn forward(&self, request: &CompletedRequest, url: &str) -> Result<Reply, PassthroughError> {
        debug!(id = %request.id, "Forwarding to: {}", url);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| PassthroughError::InvalidTarget(url.to_string()))?;
        let mut upstream = self.client.request(method, url);

        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            upstream = upstream.header(name, value);
        }
        if !request.body.is_empty() {
            upstream = upstream.body(request.body.buffer().clone());
        }

        let upstream_error = |source| PassthroughError::Upstream {
            url: url.to_string(),
            source,
        };
        let response = upstream.send().await.map_err(upstream_error)?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(k, _)| !is_hop_by_hop(k.as_str()))
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(upstream_error)?;

        debug!(id = %request.id, status, "Upstream responded");
        Ok(Reply {
            status,
            status_message: None,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CapturedBody;
    use crate::capture::Protocol;
    use bytes::Bytes;

    fn request(url: &str) -> CompletedRequest {
        CompletedRequest {
            id: "1".to_string(),
            protocol: Protocol::Http,
            method: "GET".to_string(),
            url: url.to_string(),
            path: "/".to_string(),
            hostname: "localhost".to_string(),
            normalized_url: crate::normalize::normalize(url),
            headers: Headers::new(),
            remote_address: None,
            timestamp: chrono::Utc::now(),
            body: CapturedBody::new(Bytes::new(), None),
        }
    }

    #[test]
    fn test_target_url_rewrites_origin() {
        let options = PassthroughOptions {
            forward_to: Some("http://localhost:9000/".to_string()),
        };
        let url =
            Forwarder::target_url(&request("http://localhost:8000/api/x?q=1"), &options, false)
                .unwrap();
        assert_eq!(url, "http://localhost:9000/api/x?q=1");
    }

    #[test]
    fn test_target_url_requires_proxy_traffic() {
        let options = PassthroughOptions::default();
        let req = request("http://example.com/a");
        assert_eq!(
            Forwarder::target_url(&req, &options, true).unwrap(),
            "http://example.com/a"
        );
        let err = Forwarder::target_url(&req, &options, false).unwrap_err();
        assert!(matches!(err, PassthroughError::NoTarget));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_target_url_rejects_target_with_path() {
        let options = PassthroughOptions {
            forward_to: Some("http://localhost:9000/prefix".to_string()),
        };
        assert!(matches!(
            Forwarder::target_url(&request("http://localhost/a"), &options, false),
            Err(PassthroughError::InvalidTarget(_))
        ));
    }
}
