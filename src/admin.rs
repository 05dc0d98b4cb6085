//! Sidecar listener for the metrics surface.
//!
//! Scrapes and probes go to their own port so policy routing can never
//! shadow them: `/healthz` answers `OK` and `/metrics` renders the gateway's
//! cache and request families from [`crate::metrics`].

use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Serves `/healthz` and `/metrics` on a separate port from proxied
/// traffic.
pub struct AdminListener {
    tcp_listener: TcpListener,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin port.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    pub async fn bind(addr: &str) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoint bound to {}", local_addr);
        Ok(Self {
            tcp_listener,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts scrape connections until a shutdown signal is received.
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                            continue;
                        }
                    };
                    tokio::spawn(async move {
                        let served = http1::Builder::new()
                            .serve_connection(
                                TokioIo::new(stream),
                                service_fn(|req: Request<Incoming>| async move {
                                    Ok::<_, Infallible>(handle(&req))
                                }),
                            )
                            .await;
                        if let Err(e) = served {
                            debug!("admin connection error from {}: {}", peer, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        Ok(())
    }
}

/// Routes one admin request.
fn handle<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz" => text(StatusCode::OK, "text/plain", Bytes::from("OK\n")),
        "/metrics" => match Metrics::encode() {
            Ok(rendered) => text(StatusCode::OK, METRICS_CONTENT_TYPE, Bytes::from(rendered)),
            Err(e) => {
                warn!("failed to encode metrics: {}", e);
                text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from("metrics encoding failed\n"),
                )
            }
        },
        _ => text(StatusCode::NOT_FOUND, "text/plain", Bytes::from("not found\n")),
    }
}

fn text(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
