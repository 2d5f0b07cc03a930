//! Protocol-neutral response.
//!
//! # Responsibilities
//! - Hold status, reason and outgoing headers until the head is sent
//! - Hand out exactly one body stream per response
//! - Finish framing on close and report what the connection should do next
//!
//! # Design Decisions
//! - The head is serialized exactly once: on the first `body_stream` call,
//!   or by `close` with a zero-length body if no stream was taken
//! - Protocol framing lives in the tagged [`Sink`] variant; everything a
//!   handler touches is shared

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::h1::writer::{reason_phrase, Http1Sink};
use super::h2::adapter::H2Sink;
use super::{ConnectionMode, ConnectionOutcome, Headers, Protocol, Request, Version};
use crate::body::BoxedWriter;
use crate::error::{HttpError, Result};
use crate::net::{BoxedIo, Rewind};
use crate::websocket::{self, WebSocket};

/// Smallest declared body worth compressing.
pub const MIN_GZIP_LENGTH: u64 = 1024;

/// Status line and headers, as they will be serialized.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: Headers,
    pub version: Version,
    pub mode: ConnectionMode,
}

impl ResponseHead {
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status))
    }
}

/// How the body stream should be framed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BodyPlan {
    pub length: Option<u64>,
    pub gzip_level: Option<u32>,
    /// HEAD: send the head as if a body followed, but no body bytes.
    pub suppress_body: bool,
}

pub(crate) enum Sink {
    Http1(Http1Sink),
    Http2(H2Sink),
}

/// The writable body of a response; the outermost stage of its chain.
pub struct ResponseBody {
    inner: BoxedWriter,
}

impl AsyncWrite for ResponseBody {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A response under construction.
pub struct Response {
    head: ResponseHead,
    sink: Sink,
    protocol: Protocol,
    is_head_request: bool,
    /// Level to gzip at, if the peer accepts gzip and config allows it.
    gzip_level: Option<u32>,
    compression: bool,
    max_websocket_frame: u64,
    headers_sent: bool,
    body_acquired: bool,
    body: Option<ResponseBody>,
    outcome: Option<ConnectionOutcome>,
}

impl Response {
    pub(crate) fn new(
        req: &Request,
        sink: Sink,
        gzip_level: Option<u32>,
        max_websocket_frame: u64,
    ) -> Self {
        let protocol = match sink {
            Sink::Http1(_) => Protocol::Http1,
            Sink::Http2(_) => Protocol::Http2,
        };
        let version = match protocol {
            Protocol::Http1 if req.version() >= Version::HTTP_11 => Version::HTTP_11,
            Protocol::Http1 => Version::HTTP_10,
            Protocol::Http2 => Version::HTTP_2,
        };
        Self {
            head: ResponseHead {
                status: StatusCode::OK,
                reason: None,
                headers: Headers::new(),
                version,
                mode: req.connection_mode(),
            },
            sink,
            protocol,
            is_head_request: req.method().eq_ignore_ascii_case("HEAD"),
            gzip_level: gzip_level.filter(|_| req.accepts_gzip()),
            compression: true,
            max_websocket_frame,
            headers_sent: false,
            body_acquired: false,
            body: None,
            outcome: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        self.ensure_unsent()?;
        self.head.status = status;
        Ok(())
    }

    /// Override the reason phrase (HTTP/1.x only; HTTP/2 has none).
    pub fn set_reason(&mut self, reason: impl Into<String>) -> Result<()> {
        self.ensure_unsent()?;
        self.head.reason = Some(reason.into());
        Ok(())
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> Result<&mut Headers> {
        self.ensure_unsent()?;
        Ok(&mut self.head.headers)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.headers_mut()?.set(name, value);
        Ok(())
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.headers_mut()?.append(name, value);
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Close the connection once this response is finished.
    pub fn set_close_connection(&mut self) -> Result<()> {
        self.ensure_unsent()?;
        self.head.mode = ConnectionMode::Close;
        Ok(())
    }

    pub fn is_close_connection(&self) -> bool {
        self.head.mode == ConnectionMode::Close
    }

    /// Never gzip this response, whatever the peer accepts.
    pub fn disable_compression(&mut self) {
        self.compression = false;
    }

    /// Acquire the body stream, sending the head.
    ///
    /// `Some(n)` declares a fixed length: exactly `n` bytes go on the wire,
    /// short bodies are padded and long ones truncated. `None` streams the
    /// body chunked, or close-delimited for peers that cannot take chunked.
    pub async fn body_stream(&mut self, length: Option<u64>) -> Result<&mut ResponseBody> {
        if self.body_acquired {
            return Err(HttpError::BodyAlreadyAcquired);
        }
        self.ensure_unsent()?;
        self.body_acquired = true;

        let gzip_level = self
            .gzip_level
            .filter(|_| self.compression && !self.head.headers.contains("content-encoding"))
            .filter(|_| length.map_or(true, |n| n >= MIN_GZIP_LENGTH));
        let plan = BodyPlan {
            length,
            gzip_level,
            suppress_body: self.is_head_request,
        };

        self.headers_sent = true;
        let inner = match &mut self.sink {
            Sink::Http1(sink) => sink.start(&mut self.head, plan).await?,
            Sink::Http2(sink) => sink.start(&mut self.head, plan)?,
        };
        tracing::trace!(
            status = self.head.status.as_u16(),
            protocol = self.protocol.as_str(),
            "Response head sent"
        );
        Ok(self.body.insert(ResponseBody { inner }))
    }

    /// Fixed-length acquisition, write, close.
    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<ConnectionOutcome> {
        let data = data.into();
        let body = self.body_stream(Some(data.len() as u64)).await?;
        body.write_all(&data).await?;
        self.close().await
    }

    /// Convenience: `text/plain` body with `status`.
    pub async fn send_text(&mut self, status: StatusCode, text: impl Into<String>) -> Result<ConnectionOutcome> {
        self.set_status(status)?;
        self.set_header("Content-Type", "text/plain; charset=utf-8")?;
        self.send(Bytes::from(text.into())).await
    }

    /// Finish the response.
    ///
    /// Sends a zero-length response if nothing was sent, completes the body
    /// framing and, in close mode, closes the connection. Calling it again
    /// returns the same outcome.
    pub async fn close(&mut self) -> Result<ConnectionOutcome> {
        if let Some(outcome) = self.outcome {
            return Ok(outcome);
        }
        if !self.body_acquired {
            self.body_stream(Some(0)).await?;
        }
        if let Some(body) = self.body.as_mut() {
            body.shutdown().await?;
        }
        let outcome = match &mut self.sink {
            Sink::Http1(sink) => sink.finish(self.head.mode).await?,
            // Stream-scoped, but reported like a closed connection.
            Sink::Http2(_) => ConnectionOutcome::Close,
        };
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Take the raw connection away from the server (HTTP/1.x only).
    ///
    /// Pending output is flushed first. Afterwards `close` reports
    /// [`ConnectionOutcome::Detach`] and the connection loop stops without
    /// closing the stream.
    pub async fn detach(&mut self) -> Result<Rewind<BoxedIo>> {
        let Sink::Http1(sink) = &mut self.sink else {
            return Err(HttpError::status(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "connection hand-off requires HTTP/1.x",
            ));
        };
        let io = sink
            .detach()
            .await?
            .ok_or_else(|| HttpError::Io(io::Error::from(io::ErrorKind::NotConnected)))?;
        self.headers_sent = true;
        self.body_acquired = true;
        self.outcome = Some(ConnectionOutcome::Detach);
        Ok(io)
    }

    /// Accept a WebSocket handshake and hand the connection to the framer.
    ///
    /// Validation failures are `400` (or `426` for a wrong version). The
    /// HTTP layer is left in close mode: the connection never returns to
    /// request parsing.
    pub async fn begin_websocket(&mut self, req: &Request) -> Result<WebSocket> {
        self.begin_websocket_with_protocol(req, None).await
    }

    /// [`Response::begin_websocket`], echoing `protocol` in
    /// `Sec-WebSocket-Protocol` if the client offered it.
    pub async fn begin_websocket_with_protocol(
        &mut self,
        req: &Request,
        protocol: Option<&str>,
    ) -> Result<WebSocket> {
        self.ensure_unsent()?;
        let Sink::Http1(sink) = &mut self.sink else {
            return Err(HttpError::bad_request("WebSocket upgrade requires HTTP/1.1"));
        };
        let handshake = match websocket::handshake::validate(req) {
            Ok(handshake) => handshake,
            Err(rejection) => {
                if let Some(version) = rejection.supported_version() {
                    self.head.headers.set("Sec-WebSocket-Version", version);
                }
                return Err(rejection.into());
            }
        };

        self.head.status = StatusCode::SWITCHING_PROTOCOLS;
        self.head.mode = ConnectionMode::Close;
        handshake.apply(&mut self.head.headers, protocol);
        self.headers_sent = true;
        sink.write_head(&self.head).await?;

        let io = self.detach().await?;
        Ok(WebSocket::new(io, false, self.max_websocket_frame))
    }

    fn ensure_unsent(&self) -> Result<()> {
        if self.headers_sent {
            Err(HttpError::HeadersSent)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("protocol", &self.protocol)
            .field("headers_sent", &self.headers_sent)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}
