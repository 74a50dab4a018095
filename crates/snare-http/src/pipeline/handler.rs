//! Per-request flow: capture, match, handle, respond, publish.

use super::headers::{X_SNARE_HANDLER_ERROR, X_SNARE_PASSTHROUGH_ERROR, X_SNARE_UNMATCHED};
use super::passthrough::{Forwarder, PassthroughError};
use super::response::{build_response, PreparedResponse};
use super::{ConnectionInfo, Pipeline, Stage};
use crate::body::CapturedBody;
use crate::capture::{
    CompletedRequest, CompletedResponse, ErrorInfo, ErrorKind, Headers, Protocol,
};
use crate::events::Event;
use crate::normalize::normalize;
use crate::rules::{Handler, Reply};
use bytes::Bytes;
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Run one request through the pipeline and return the response to write.
///
/// Both events for the request are published before this returns.
pub async fn handle_request<B>(
    pipeline: &Pipeline,
    req: Request<B>,
    conn: &ConnectionInfo,
) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();
    let mut stage = Stage::Receiving;

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            stage.fail("-", &e.to_string());
            return build_response(StatusCode::BAD_REQUEST, format!("Failed to read request body: {e}"));
        }
    };

    let (request, proxied) = capture_request(&parts, body, conn);
    let request = Arc::new(request);
    stage.advance(Stage::Captured, &request.id);
    debug!(
        id = %request.id,
        method = %request.method,
        url = %request.url,
        "Captured request"
    );
    pipeline.bus.publish(&Event::Request(Arc::clone(&request))).await;

    stage.advance(Stage::Matching, &request.id);
    let outcome = match pipeline.registry.claim(&request) {
        Some(rule) => {
            debug!(id = %request.id, rule = %rule.id, "Matched rule");
            stage.advance(Stage::Handling, &request.id);
            run_handler(pipeline, &rule.handler, &request, proxied).await
        }
        None => Err(Failure {
            kind: ErrorKind::UnmatchedRequest,
            message: format!("No rule matched {} {}", request.method, request.url),
        }),
    };

    let is_head = parts.method == Method::HEAD;
    let (prepared, error) = match outcome
        .and_then(|reply| PreparedResponse::from_reply(reply, is_head).map_err(Failure::handler))
    {
        Ok(prepared) => {
            stage.advance(Stage::Responding, &request.id);
            (prepared, None)
        }
        Err(failure) => {
            stage.fail(&request.id, &failure.message);
            let prepared = failure_response(pipeline, &request, &failure);
            (
                prepared,
                Some(ErrorInfo {
                    kind: failure.kind,
                    message: failure.message,
                }),
            )
        }
    };

    let response = Arc::new(CompletedResponse {
        id: request.id.clone(),
        status_code: prepared.status.as_u16(),
        status_message: prepared.status_message.clone(),
        body: CapturedBody::new(prepared.body.clone(), prepared.headers.get("content-encoding")),
        headers: prepared.headers.clone(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        error,
    });
    pipeline.bus.publish(&Event::Response(response)).await;
    stage.advance(Stage::Completed, &request.id);

    prepared.into_hyper()
}

struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn handler(e: impl std::fmt::Display) -> Self {
        Failure {
            kind: ErrorKind::HandlerError,
            message: e.to_string(),
        }
    }
}

async fn run_handler(
    pipeline: &Pipeline,
    handler: &Handler,
    request: &Arc<CompletedRequest>,
    proxied: bool,
) -> Result<Reply, Failure> {
    match handler {
        Handler::StaticReply(reply) => Ok(reply.clone()),
        Handler::Passthrough(options) => {
            let url = Forwarder::target_url(request, options, proxied).map_err(Failure::handler)?;
            pipeline
                .forwarder
                .forward(request, &url)
                .await
                .map_err(|e: PassthroughError| {
                    warn!(id = %request.id, "Passthrough failed: {}", e);
                    if e.is_configuration_error() {
                        Failure::handler(e)
                    } else {
                        Failure {
                            kind: ErrorKind::PassthroughError,
                            message: e.to_string(),
                        }
                    }
                })
        }
        Handler::Callback(callback) => {
            match AssertUnwindSafe(callback.call(Arc::clone(request)))
                .catch_unwind()
                .await
            {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => {
                    warn!(id = %request.id, "Rule callback failed: {:#}", e);
                    Err(Failure::handler(format!("{e:#}")))
                }
                Err(_) => {
                    warn!(id = %request.id, "Rule callback panicked");
                    Err(Failure::handler("rule callback panicked"))
                }
            }
        }
    }
}

fn failure_response(
    pipeline: &Pipeline,
    request: &CompletedRequest,
    failure: &Failure,
) -> PreparedResponse {
    match failure.kind {
        ErrorKind::UnmatchedRequest => {
            let mut prepared = PreparedResponse::plain_text(
                StatusCode::SERVICE_UNAVAILABLE,
                unmatched_explanation(pipeline, request),
            );
            prepared.headers.set(X_SNARE_UNMATCHED.as_str(), "true");
            prepared
        }
        ErrorKind::HandlerError => {
            let mut prepared = PreparedResponse::plain_text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error in rule handler: {}", failure.message),
            );
            prepared.headers.set(X_SNARE_HANDLER_ERROR.as_str(), "true");
            prepared
        }
        ErrorKind::PassthroughError => {
            let mut prepared = PreparedResponse::plain_text(
                StatusCode::BAD_GATEWAY,
                format!("Error communicating with upstream server: {}", failure.message),
            );
            prepared.headers.set(X_SNARE_PASSTHROUGH_ERROR.as_str(), "true");
            prepared
        }
    }
}

fn unmatched_explanation(pipeline: &Pipeline, request: &CompletedRequest) -> String {
    let mut text = format!(
        "No rules were found matching this request.\nThis request was: {} {}\n\n",
        request.method, request.url
    );
    let rules = pipeline.registry.explanations();
    if rules.is_empty() {
        text.push_str("There are no rules configured.\n");
    } else {
        text.push_str("The configured rules are:\n");
        for rule in rules {
            text.push_str(&rule);
            text.push('\n');
        }
    }
    text
}

/// Build the captured request. Also reports whether the request arrived as
/// proxy traffic.
fn capture_request(parts: &Parts, body: Bytes, conn: &ConnectionInfo) -> (CompletedRequest, bool) {
    let headers = Headers::from_header_map(&parts.headers);
    let uri = &parts.uri;
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let (url, protocol, authority, proxied) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => {
            let protocol = if scheme.eq_ignore_ascii_case("https") {
                Protocol::Https
            } else {
                Protocol::Http
            };
            (uri.to_string(), protocol, authority.as_str().to_string(), true)
        }
        _ => {
            let authority = headers
                .get("host")
                .map(str::to_string)
                .or_else(|| conn.tunnel_authority.clone())
                .unwrap_or_else(|| "localhost".to_string());
            (
                format!("{}://{}{}", conn.protocol.as_str(), authority, path),
                conn.protocol,
                authority,
                conn.tunnel_authority.is_some(),
            )
        }
    };

    let request = CompletedRequest {
        id: uuid::Uuid::new_v4().to_string(),
        protocol,
        method: parts.method.as_str().to_string(),
        normalized_url: normalize(&url),
        hostname: hostname_of(&authority).to_string(),
        url,
        path,
        body: CapturedBody::new(body, headers.get("content-encoding")),
        headers,
        remote_address: conn.remote_addr.map(|addr| addr.ip().to_string()),
        timestamp: chrono::Utc::now(),
    };
    (request, proxied)
}

/// Host part of an authority, without port or userinfo.
fn hostname_of(authority: &str) -> &str {
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PassthroughConfig;
    use crate::events::{EventBus, Subscriber};
    use crate::rules::{Callback, Matcher, RuleDefinition, RuleRegistry};
    use parking_lot::Mutex;

    fn pipeline() -> Pipeline {
        Pipeline {
            registry: Arc::new(RuleRegistry::new()),
            bus: Arc::new(EventBus::new()),
            forwarder: Forwarder::new(&PassthroughConfig::default()).unwrap(),
        }
    }

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            protocol: Protocol::Http,
            remote_addr: None,
            tunnel_authority: None,
        }
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", "localhost:8000")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn record(pipeline: &Pipeline) -> Arc<Mutex<Vec<Event>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        pipeline
            .bus
            .subscribe(Subscriber::request(move |r| e.lock().push(Event::Request(r))));
        let e = Arc::clone(&events);
        pipeline
            .bus
            .subscribe(Subscriber::response(move |r| e.lock().push(Event::Response(r))));
        events
    }

    #[test]
    fn test_hostname_of() {
        assert_eq!(hostname_of("localhost:8000"), "localhost");
        assert_eq!(hostname_of("example.com"), "example.com");
        assert_eq!(hostname_of("[::1]:8080"), "::1");
        assert_eq!(hostname_of("user:pw@host:1"), "host");
    }

    #[tokio::test]
    async fn test_static_reply_flow() {
        let pipeline = pipeline();
        let events = record(&pipeline);
        pipeline
            .registry
            .add(RuleDefinition {
                matchers: vec![Matcher::method("GET"), Matcher::url("/mocked-endpoint")],
                handler: Handler::StaticReply(
                    Reply::new(200)
                        .with_body("Mock response")
                        .with_header("x-extra-header", "present"),
                ),
                times: None,
            })
            .unwrap();

        let response = handle_request(&pipeline, get("/mocked-endpoint?x=1"), &conn()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-extra-header").unwrap(), "present");

        let events = events.lock();
        assert_eq!(events.len(), 2);
        let (Event::Request(req), Event::Response(resp)) = (&events[0], &events[1]) else {
            panic!("unexpected event order");
        };
        assert_eq!(req.id, resp.id);
        assert_eq!(req.url, "http://localhost:8000/mocked-endpoint?x=1");
        assert_eq!(req.path, "/mocked-endpoint?x=1");
        assert_eq!(req.hostname, "localhost");
        assert_eq!(resp.body.text(), Some("Mock response"));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_unmatched_request() {
        let pipeline = pipeline();
        let events = record(&pipeline);

        let response = handle_request(&pipeline, get("/missing"), &conn()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(&X_SNARE_UNMATCHED).unwrap(), "true");

        let events = events.lock();
        assert_eq!(events.len(), 2);
        let Event::Response(resp) = &events[1] else {
            panic!("expected response event");
        };
        assert_eq!(resp.error.as_ref().map(|e| e.kind), Some(ErrorKind::UnmatchedRequest));
        assert!(resp
            .body
            .text()
            .unwrap()
            .starts_with("No rules were found matching this request."));
    }

    #[tokio::test]
    async fn test_callback_error_and_panic() {
        let pipeline = pipeline();
        pipeline
            .registry
            .add(RuleDefinition {
                matchers: vec![Matcher::url("/err")],
                handler: Handler::Callback(Callback::new(|_| async {
                    Err::<Reply, _>(anyhow::anyhow!("boom"))
                })),
                times: None,
            })
            .unwrap();
        pipeline
            .registry
            .add(RuleDefinition {
                matchers: vec![Matcher::url("/panic")],
                handler: Handler::Callback(Callback::new(|req: Arc<CompletedRequest>| async move {
                    if req.method == "GET" {
                        panic!("kaboom");
                    }
                    Ok(Reply::new(200))
                })),
                times: None,
            })
            .unwrap();

        for path in ["/err", "/panic"] {
            let response = handle_request(&pipeline, get(path), &conn()).await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(response.headers().get(&X_SNARE_HANDLER_ERROR).unwrap(), "true");
        }
    }

    #[tokio::test]
    async fn test_direct_passthrough_without_target_is_handler_error() {
        let pipeline = pipeline();
        pipeline
            .registry
            .add(RuleDefinition {
                matchers: vec![],
                handler: Handler::Passthrough(Default::default()),
                times: None,
            })
            .unwrap();

        let response = handle_request(&pipeline, get("/anything"), &conn()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_absolute_form_request_is_proxy_traffic() {
        let pipeline = pipeline();
        let events = record(&pipeline);
        let req = Request::builder()
            .method("GET")
            .uri("http://example.com/a?b=1")
            .body(Full::new(Bytes::new()))
            .unwrap();

        handle_request(&pipeline, req, &conn()).await;

        let events = events.lock();
        let Event::Request(captured) = &events[0] else {
            panic!("expected request event");
        };
        assert_eq!(captured.url, "http://example.com/a?b=1");
        assert_eq!(captured.hostname, "example.com");
        assert_eq!(captured.normalized_url, "http://example.com/a");
    }
}
