//! Protocol-neutral request.
//!
//! Built by `h1::parser` or `h2::adapter`; handlers only see this type.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use super::{ConnectionMode, Headers, Protocol, Version};
use crate::body::{self, BoxedReader};
use crate::error::{HttpError, Result};

/// A request body: the fully composed decode chain for this request.
///
/// Reading it to EOF (or [`Request::drain_body`]) leaves the connection at
/// the first byte after the body.
pub struct RequestBody {
    inner: BoxedReader,
    finished: bool,
}

impl RequestBody {
    pub(crate) fn new(inner: BoxedReader) -> Self {
        Self {
            inner,
            finished: false,
        }
    }

    /// True once EOF has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl AsyncRead for RequestBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.finished {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if buf.filled().len() == before && buf.remaining() > 0 {
            self.finished = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

/// A parsed request, independent of the protocol generation that carried it.
#[derive(Debug)]
pub struct Request {
    method: String,
    target: String,
    version: Version,
    headers: Headers,
    remote_addr: SocketAddr,
    protocol: Protocol,
    connection_mode: ConnectionMode,
    has_body: bool,
    body: Option<RequestBody>,
    is_websocket: bool,
    is_h2c_upgradable: bool,
    is_h2c_upgradable_after_reading_body: bool,
}

impl Request {
    pub(crate) fn new(
        protocol: Protocol,
        method: String,
        target: String,
        version: Version,
        headers: Headers,
        remote_addr: SocketAddr,
    ) -> Self {
        let connection_mode = if version >= Version::HTTP_11 {
            ConnectionMode::KeepAlive
        } else {
            ConnectionMode::Close
        };
        Self {
            method,
            target,
            version,
            headers,
            remote_addr,
            protocol,
            connection_mode,
            has_body: false,
            body: None,
            is_websocket: false,
            is_h2c_upgradable: false,
            is_h2c_upgradable_after_reading_body: false,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw request target as sent.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Target path without query; absolute-form targets are reduced to their path.
    pub fn path(&self) -> &str {
        let target = strip_authority(&self.target);
        match target.find('?') {
            Some(i) => &target[..i],
            None => target,
        }
    }

    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Caller address, or the forwarded-for address when behind a trusted proxy.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// `Content-Type` without parameters, lower-cased.
    pub fn media_type(&self) -> Option<String> {
        self.content_type()
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .filter(|mt| !mt.is_empty())
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn is_websocket(&self) -> bool {
        self.is_websocket
    }

    pub fn is_h2c_upgradable(&self) -> bool {
        self.is_h2c_upgradable
    }

    pub fn is_h2c_upgradable_after_reading_body(&self) -> bool {
        self.is_h2c_upgradable_after_reading_body
    }

    pub fn has_body(&self) -> bool {
        self.has_body
    }

    /// The body stream, if the request framing declared one.
    pub fn body(&mut self) -> Option<&mut RequestBody> {
        self.body.as_mut()
    }

    /// Read the whole body into memory; more than `limit` bytes is a `413`.
    pub async fn read_body_to_end(&mut self, limit: usize) -> Result<Bytes> {
        let Some(body) = self.body.as_mut() else {
            return Ok(Bytes::new());
        };
        let mut data = Vec::new();
        (&mut *body).take(limit as u64 + 1).read_to_end(&mut data).await?;
        if data.len() > limit {
            return Err(HttpError::status(
                http::StatusCode::PAYLOAD_TOO_LARGE,
                format!("request body exceeds {limit} bytes"),
            ));
        }
        Ok(Bytes::from(data))
    }

    /// Read and discard whatever is left of the body.
    ///
    /// Undecodable content-coding does not stop the drain: every decoder
    /// fails at most once and then passes the framing through, so the
    /// connection still ends up at the next request.
    pub async fn drain_body(&mut self) -> io::Result<u64> {
        let Some(body) = self.body.as_mut() else {
            return Ok(0);
        };
        while !body.is_finished() {
            match body::drain(&mut *body).await {
                Ok(drained) => return Ok(drained),
                Err(err) if body::is_corrupt_coding(&err) => {
                    tracing::debug!(error = %err, "Discarding undecodable request body");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(0)
    }

    /// Content-codings from `Accept-Encoding`, in order, excluding `q=0` entries.
    pub fn accept_encodings(&self) -> Vec<String> {
        self.headers
            .tokens("accept-encoding")
            .filter_map(|token| {
                let mut parts = token.split(';');
                let coding = parts.next()?.trim().to_ascii_lowercase();
                let refused = parts.any(|p| {
                    p.trim()
                        .strip_prefix("q=")
                        .and_then(|q| q.trim().parse::<f32>().ok())
                        .is_some_and(|q| q <= 0.0)
                });
                (!refused && !coding.is_empty()).then_some(coding)
            })
            .collect()
    }

    pub(crate) fn accepts_gzip(&self) -> bool {
        self.accept_encodings()
            .iter()
            .any(|c| c == "gzip" || c == "x-gzip" || c == "*")
    }

    pub(crate) fn set_connection_mode(&mut self, mode: ConnectionMode) {
        self.connection_mode = mode;
    }

    pub(crate) fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = addr;
    }

    pub(crate) fn set_body(&mut self, body: Option<BoxedReader>) {
        self.has_body = body.is_some();
        self.body = body.map(RequestBody::new);
    }

    pub(crate) fn set_upgrade_flags(&mut self, websocket: bool, h2c: bool, h2c_after_body: bool) {
        self.is_websocket = websocket;
        self.is_h2c_upgradable = h2c;
        self.is_h2c_upgradable_after_reading_body = h2c_after_body;
    }
}

fn strip_authority(target: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let rest = &target[scheme.len()..];
            return match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            };
        }
    }
    target
}
