//! Connection acceptor and per-connection protocol loop.
//!
//! # Responsibilities
//! - Accept connections under the listener's admission permit
//! - Terminate TLS before any protocol sniffing
//! - Sniff the first request head: prior-knowledge HTTP/2, h2c upgrade, or
//!   an HTTP/1.x keep-alive loop
//! - Answer fatal parse errors with the most specific status, then close
//! - Drain live connections on shutdown
//!
//! # Design Decisions
//! - One tokio task per connection; HTTP/2 streams get their own tasks
//! - A failed TLS handshake drops the connection without a word, so a
//!   rejected client cannot tell it apart from a network failure
//! - Peer disconnects are logged at debug, never as errors
//! - `idle_secs` bounds every wait on the peer: the next request head, each
//!   body read, and the drain of a body the handler left unread

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;

use super::h1::parser::{read_headers, read_request_line, RequestContext};
use super::h1::writer::{write_error_response, Http1Sink};
use super::h1::{parser, ParseLimits};
use super::h2::{adapter, upgrade};
use super::response::Sink;
use super::{ConnectionOutcome, Dispatcher, Response, Version};
use crate::config::ServerConfig;
use crate::error::{HttpError, Result};
use crate::lifecycle::Shutdown;
use crate::net::tls::load_tls_acceptor;
use crate::net::{BoxedIo, ConnectionPermit, ConnectionTracker, Io, Listener, ListenerError, Wire};
use crate::observability::metrics;

/// How long shutdown waits for open connections to finish.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Pause after a failed `accept()` so a persistent error (e.g. EMFILE)
/// does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long unread input is drained after the server closes its side.
const LINGER: Duration = Duration::from_secs(2);

/// Settings every connection task needs, shared behind an `Arc`.
pub(crate) struct ServeContext {
    pub dispatcher: Arc<Dispatcher>,
    pub limits: ParseLimits,
    pub idle_timeout: Duration,
    pub behind_proxy: bool,
    pub gzip_level: Option<u32>,
    pub h2c_body_limit: usize,
    pub max_websocket_frame: u64,
}

impl ServeContext {
    fn from_config(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            limits: ParseLimits {
                max_request_line: config.limits.max_request_line,
                max_header_bytes: config.limits.max_header_bytes,
            },
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            behind_proxy: config.listener.behind_proxy,
            gzip_level: config
                .compression
                .enabled
                .then_some(config.compression.level),
            h2c_body_limit: config.limits.h2c_upgrade_body_limit,
            max_websocket_frame: config.limits.max_websocket_frame,
        }
    }
}

/// HTTP/1.x + HTTP/2 server over a [`Listener`].
pub struct HttpServer {
    ctx: Arc<ServeContext>,
    tls: Option<TlsAcceptor>,
    tls_handshake_timeout: Duration,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Create a server; loads the TLS certificate when one is configured.
    pub fn new(config: &ServerConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, ListenerError> {
        let tls = match &config.listener.tls {
            Some(tls) => Some(
                load_tls_acceptor(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                    .map_err(ListenerError::Tls)?,
            ),
            None => None,
        };

        Ok(Self {
            ctx: Arc::new(ServeContext::from_config(config, dispatcher)),
            tls,
            tls_handshake_timeout: Duration::from_secs(config.timeouts.tls_handshake_secs),
            tracker: ConnectionTracker::new(),
        })
    }

    /// Terminate TLS with `acceptor` instead of the configured certificate.
    pub fn with_tls_acceptor(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Live connection bookkeeping.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until `shutdown` fires, then wait for open
    /// connections to drain.
    pub async fn run(&self, listener: Listener, shutdown: Shutdown) {
        let mut shutdown_rx = shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                tls = self.tls.is_some(),
                max_connections = listener.max_connections(),
                "HTTP server starting"
            );
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => self.spawn_connection(stream, peer_addr, permit),
                    Err(ListenerError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }
        drop(listener);

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, "Waiting for connections to drain");
        }
        if !self.tracker.wait_for_drain(DRAIN_DEADLINE).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain deadline passed with connections still open"
            );
        }
        tracing::info!("HTTP server stopped");
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr, permit: ConnectionPermit) {
        let ctx = Arc::clone(&self.ctx);
        let tls = self.tls.clone();
        let is_tls = tls.is_some();
        let handshake_timeout = self.tls_handshake_timeout;
        let guard = self.tracker.track(is_tls);
        let span = tracing::info_span!(
            "connection",
            connection_id = %guard.id(),
            peer_addr = %peer_addr,
            tls = is_tls
        );

        tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                let io: BoxedIo = match tls {
                    Some(acceptor) => {
                        match timeout(handshake_timeout, acceptor.accept(stream)).await {
                            Ok(Ok(stream)) => Box::new(stream),
                            Ok(Err(err)) => {
                                tracing::debug!(error = %err, "TLS handshake failed");
                                return;
                            }
                            Err(_) => {
                                tracing::debug!("TLS handshake timed out");
                                return;
                            }
                        }
                    }
                    None => Box::new(stream),
                };
                serve(Wire::new(io), peer_addr, is_tls, ctx).await;
            }
            .instrument(span),
        );
    }

    /// Serve one already-established connection on the current task.
    ///
    /// The stream is treated as plaintext; `tls` only disables the h2c
    /// upgrade for streams that were decrypted elsewhere.
    pub async fn serve_io<T: Io>(&self, io: T, remote_addr: SocketAddr, tls: bool) {
        let _guard = self.tracker.track(tls);
        serve(Wire::new(Box::new(io)), remote_addr, tls, Arc::clone(&self.ctx)).await;
    }
}

async fn serve(wire: Wire, remote_addr: SocketAddr, tls: bool, ctx: Arc<ServeContext>) {
    tracing::trace!("Connection open");
    if let Err(err) = serve_http1(&wire, remote_addr, tls, &ctx).await {
        if let HttpError::Status { status, message } = &err {
            metrics::protocol_error(rejection_kind(*status));
            if let Err(write_err) = write_error_response(&wire, *status, message).await {
                tracing::trace!(error = %write_err, "Could not deliver error response");
            }
        }
        log_failure(&err);
    }
    linger(&wire).await;
}

/// Closing a socket with unread input resets it, which can destroy a
/// response the peer has not read yet.
async fn linger(wire: &Wire) {
    if wire.is_detached() {
        return;
    }
    let mut reader = wire.reader();
    let _ = timeout(LINGER, tokio::io::copy(&mut reader, &mut tokio::io::sink())).await;
}

/// The HTTP/1.x keep-alive loop, including the promotion to HTTP/2.
///
/// Errors returned from here arrived before a response existed; anything
/// that fails mid-response is handled in place.
async fn serve_http1(wire: &Wire, remote_addr: SocketAddr, tls: bool, ctx: &Arc<ServeContext>) -> Result<()> {
    loop {
        let mut reader = wire.reader();
        let head = timeout(ctx.idle_timeout, async {
            let Some(line) = read_request_line(&mut reader, &ctx.limits).await? else {
                return Ok(None);
            };
            let headers = read_headers(&mut reader, &ctx.limits).await?;
            Ok::<_, HttpError>(Some((line, headers)))
        })
        .await;

        let (line, headers) = match head {
            Ok(Ok(Some(head))) => head,
            Ok(Ok(None)) => {
                tracing::trace!("Peer closed between requests");
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::debug!(idle_secs = ctx.idle_timeout.as_secs(), "Idle timeout");
                return Ok(());
            }
        };

        if line.is_h2_preface() {
            let io = match upgrade::accept_prior_knowledge(wire).await {
                Ok(io) => io,
                Err(err) => return abandon_h2(err),
            };
            tracing::debug!("HTTP/2 with prior knowledge");
            return adapter::serve_connection(io, remote_addr, Arc::clone(ctx)).await;
        }
        if line.version.major != 1 {
            return Err(HttpError::status(
                http::StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                format!("unsupported protocol {}", line.version),
            ));
        }

        let version = line.version;
        let headers_sent = Arc::new(AtomicBool::new(false));
        let mut req = parser::build_request(
            line,
            headers,
            &RequestContext {
                wire,
                headers_sent: &headers_sent,
                remote_addr,
                tls,
                behind_proxy: ctx.behind_proxy,
                h2c_body_limit: ctx.h2c_body_limit,
                read_timeout: ctx.idle_timeout,
            },
        )?;

        if req.is_h2c_upgradable() || req.is_h2c_upgradable_after_reading_body() {
            let body = req.read_body_to_end(ctx.h2c_body_limit).await?;
            let io = match upgrade::accept_h2c(wire, &req, body).await {
                Ok(io) => io,
                Err(err) => return abandon_h2(err),
            };
            return adapter::serve_connection(io, remote_addr, Arc::clone(ctx)).await;
        }

        let chunked_ok = req.headers().contains("te") || version >= Version::HTTP_11;
        let sink = Sink::Http1(Http1Sink::new(wire.clone(), headers_sent, chunked_ok));
        let mut res = Response::new(&req, sink, ctx.gzip_level, ctx.max_websocket_frame);

        let is_write = req.method() == "POST" || req.method() == "PUT";
        if is_write && !req.has_body() {
            metrics::protocol_error("missing_body");
            tracing::debug!(method = %req.method(), target = %req.target(), "Write request without a body");
            res.set_close_connection()?;
            res.send_text(http::StatusCode::BAD_REQUEST, "Request body required")
                .await?;
            return Ok(());
        }

        match ctx.dispatcher.dispatch(&mut req, &mut res).await {
            Ok(ConnectionOutcome::Continue) => match timeout(ctx.idle_timeout, req.drain_body()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "Request body drain failed");
                    return Ok(());
                }
                Err(_) => {
                    tracing::debug!(idle_secs = ctx.idle_timeout.as_secs(), "Request body drain timed out");
                    return Ok(());
                }
            },
            Ok(ConnectionOutcome::Close) => return Ok(()),
            Ok(ConnectionOutcome::Detach) => {
                tracing::trace!("Connection handed off");
                return Ok(());
            }
            Err(err) => {
                log_failure(&err);
                if let Err(shutdown_err) = wire.shutdown().await {
                    tracing::trace!(error = %shutdown_err, "Shutdown after failure");
                }
                return Ok(());
            }
        }
    }
}

/// A broken HTTP/2 preface ends the connection; whatever was sent already
/// (a `101`, for h2c) cannot be followed by an HTTP/1.x error.
fn abandon_h2(err: HttpError) -> Result<()> {
    metrics::protocol_error("h2_preface");
    tracing::debug!(error = %err, "HTTP/2 preface rejected");
    Ok(())
}

fn rejection_kind(status: http::StatusCode) -> &'static str {
    match status.as_u16() {
        431 => "header_too_large",
        501 => "unsupported_coding",
        505 => "unsupported_version",
        _ => "malformed_request",
    }
}

fn log_failure(err: &HttpError) {
    if err.is_transient() {
        tracing::debug!(error = %err, "Connection dropped by peer");
    } else if let Some(status) = err.status_code() {
        tracing::debug!(status = status.as_u16(), error = %err, "Request rejected");
    } else {
        tracing::error!(error = %err, "Connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server() -> HttpServer {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.add_exact(
            "/hello",
            handler_fn(|_req, res| {
                Box::pin(async move {
                    res.send_text(http::StatusCode::OK, "hi").await?;
                    Ok(())
                })
            }),
        );
        HttpServer::new(&ServerConfig::default(), dispatcher).unwrap()
    }

    async fn exchange(raw: &[u8]) -> String {
        let server = server();
        let (client, io) = tokio::io::duplex(64 * 1024);
        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(raw).await.unwrap();
        wr.shutdown().await.unwrap();

        server.serve_io(io, "127.0.0.1:4000".parse().unwrap(), false).await;
        let mut out = String::new();
        rd.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let out = exchange(
            b"GET /hello HTTP/1.1\r\nHost: a\r\n\r\nGET /nope HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n",
        )
        .await;
        let first = out.find("HTTP/1.1 200 OK").unwrap();
        let second = out.find("HTTP/1.1 404 Not Found").unwrap();
        assert!(first < second, "{out}");
        assert!(out.ends_with("Not Found"));
    }

    #[tokio::test]
    async fn http3_version_is_rejected_once() {
        let out = exchange(b"GET / HTTP/3.0\r\nHost: a\r\n\r\nGET /hello HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 505 "), "{out}");
        assert_eq!(out.matches("HTTP/1.1 ").count(), 1);
    }

    #[tokio::test]
    async fn http2_request_line_without_preface_is_505() {
        let out = exchange(b"GET / HTTP/2.0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 505 "), "{out}");
    }

    #[tokio::test]
    async fn post_without_body_is_400_and_closes() {
        let out = exchange(b"POST /hello HTTP/1.1\r\nHost: a\r\n\r\nGET /hello HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("200 OK"));
    }

    #[tokio::test]
    async fn missing_host_is_400() {
        let out = exchange(b"GET /hello HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 "), "{out}");
    }
}
