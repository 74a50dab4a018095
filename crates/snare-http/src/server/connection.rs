//! Serving accepted connections and CONNECT tunnels.

use crate::capture::Protocol;
use crate::pipeline::{build_response, handle_request, ConnectionInfo, Pipeline};
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// State shared by every connection of one running server
pub(crate) struct ConnectionContext {
    pub pipeline: Arc<Pipeline>,
    pub tls: Option<TlsAcceptor>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

/// Serve a freshly accepted TCP connection, performing the TLS handshake first
/// when the server is configured for HTTPS.
pub(crate) async fn serve_accepted(stream: TcpStream, addr: SocketAddr, ctx: Arc<ConnectionContext>) {
    match ctx.tls.clone() {
        Some(acceptor) => {
            let handshake = tokio::select! {
                result = acceptor.accept(stream) => result,
                _ = ctx.shutdown.cancelled() => {
                    debug!("Dropping TLS handshake from {} on shutdown", addr);
                    return;
                }
            };
            match handshake {
                Ok(tls_stream) => {
                    let info = ConnectionInfo {
                        protocol: Protocol::Https,
                        remote_addr: Some(addr),
                        tunnel_authority: None,
                    };
                    serve(TokioIo::new(tls_stream), ctx, info).await
                }
                Err(err) => debug!("TLS handshake failed from {}: {}", addr, err),
            }
        }
        None => {
            let info = ConnectionInfo {
                protocol: Protocol::Http,
                remote_addr: Some(addr),
                tunnel_authority: None,
            };
            serve(TokioIo::new(stream), ctx, info).await
        }
    }
}

/// Serve HTTP/1.1 on `io` until the peer closes or the server shuts down.
///
/// On shutdown the connection finishes any in-flight request before closing.
async fn serve<I>(io: I, ctx: Arc<ConnectionContext>, info: ConnectionInfo)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service_ctx = Arc::clone(&ctx);
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&service_ctx);
        let info = info.clone();
        async move {
            if req.method() == Method::CONNECT {
                return Ok::<_, Infallible>(open_tunnel(ctx, req, &info));
            }
            Ok(handle_request(&ctx.pipeline, req, &info).await)
        }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Connection error: {}", e);
            }
        }
        _ = ctx.shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!("Connection error during shutdown: {}", e);
            }
        }
    }
}

/// Answer a CONNECT with 200 and serve the tunnelled stream through the
/// same pipeline, terminating TLS when the server has a certificate.
fn open_tunnel(
    ctx: Arc<ConnectionContext>,
    req: Request<Incoming>,
    info: &ConnectionInfo,
) -> hyper::Response<http_body_util::Full<Bytes>> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return build_response(StatusCode::BAD_REQUEST, "CONNECT requires a host:port target");
    };
    debug!(authority = %authority, "Opening tunnel");

    let tunnel_info = ConnectionInfo {
        protocol: if ctx.tls.is_some() {
            Protocol::Https
        } else {
            Protocol::Http
        },
        remote_addr: info.remote_addr,
        tunnel_authority: Some(authority),
    };
    let tunnel_ctx = Arc::clone(&ctx);
    ctx.tracker.spawn(async move {
        let upgrade = tokio::select! {
            result = hyper::upgrade::on(req) => result,
            _ = tunnel_ctx.shutdown.cancelled() => return,
        };
        match upgrade {
            Ok(upgraded) => serve_tunnel(upgraded, tunnel_ctx, tunnel_info).await,
            Err(e) => debug!("CONNECT upgrade failed: {}", e),
        }
    });

    build_response(StatusCode::OK, Bytes::new())
}

fn serve_tunnel(
    upgraded: Upgraded,
    ctx: Arc<ConnectionContext>,
    info: ConnectionInfo,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        match ctx.tls.clone() {
            Some(acceptor) => {
                let handshake = tokio::select! {
                    result = acceptor.accept(TokioIo::new(upgraded)) => result,
                    _ = ctx.shutdown.cancelled() => return,
                };
                match handshake {
                    Ok(tls_stream) => serve(TokioIo::new(tls_stream), ctx, info).await,
                    Err(e) => debug!("TLS handshake inside tunnel failed: {}", e),
                }
            }
            None => serve(upgraded, ctx, info).await,
        }
    })
}
