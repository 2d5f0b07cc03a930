//! HTTP/2 stream adapter.
//!
//! # Data Flow
//! ```text
//! h2::server::Connection ─accept→ (http::Request<RecvStream>, SendResponse)
//!     → Request  (pseudo-headers → method/target, RecvStream → H2BodyReader)
//!     → Dispatcher (spawned per stream)
//!     → Response (H2Sink: HEADERS once, H2BodyWriter: DATA with flow control)
//! ```
//!
//! # Design Decisions
//! - Framing, HPACK and flow control belong to the `h2` crate; this module
//!   only maps its stream handles onto the protocol-neutral types
//! - Each stream runs on its own task so a slow handler never starves frame
//!   delivery to its siblings
//! - Received DATA is released back to the flow-control window as soon as
//!   it is read; draining an unread body keeps the connection window moving

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};

use ::h2::server::SendResponse;
use ::h2::{Reason, RecvStream, SendStream};
use ::http::header::{
    HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, COOKIE, SERVER, VARY,
};
use bytes::{Buf, Bytes};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::Instrument;

use crate::body::{decode_content_codings, BoxedReader, BoxedWriter, Discard, GzipWriter};
use crate::error::Result;
use crate::http::h1::parser::forwarded_for;
use crate::http::h1::writer::{status_forbids_body, SERVER_NAME};
use crate::http::response::{BodyPlan, ResponseHead, Sink};
use crate::http::server::ServeContext;
use crate::http::{Headers, Protocol, Request, Response, Version};
use crate::observability::metrics;

/// Response fields with no meaning on a multiplexed stream.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

type Responder = Arc<Mutex<SendResponse<Bytes>>>;

fn lock(respond: &Responder) -> MutexGuard<'_, SendResponse<Bytes>> {
    respond.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn h2_io_error(err: ::h2::Error) -> io::Error {
    if err.is_io() {
        return err
            .into_io()
            .unwrap_or_else(|| io::ErrorKind::BrokenPipe.into());
    }
    let kind = if err.is_reset() || err.is_go_away() {
        io::ErrorKind::BrokenPipe
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err)
}

/// Drive an HTTP/2 session until the peer goes away.
///
/// `io` must start with the client connection preface (replayed by the
/// caller for prior-knowledge and h2c connections).
pub(crate) async fn serve_connection<T>(io: T, remote_addr: SocketAddr, ctx: Arc<ServeContext>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = ::h2::server::handshake(io).await?;
    tracing::debug!("HTTP/2 session established");

    while let Some(accepted) = connection.accept().await {
        let (request, respond) = accepted?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(serve_stream(request, respond, remote_addr, ctx).in_current_span());
    }

    tracing::debug!("HTTP/2 session finished");
    Ok(())
}

async fn serve_stream(
    request: ::http::Request<RecvStream>,
    respond: SendResponse<Bytes>,
    remote_addr: SocketAddr,
    ctx: Arc<ServeContext>,
) {
    let respond: Responder = Arc::new(Mutex::new(respond));
    let (parts, recv) = request.into_parts();

    let Some(target) = parts.uri.path_and_query().map(|pq| pq.as_str().to_string()) else {
        tracing::debug!(method = %parts.method, "Stream without :path");
        metrics::protocol_error("h2_missing_pseudo_header");
        lock(&respond).send_reset(Reason::PROTOCOL_ERROR);
        return;
    };

    let mut headers = Headers::new();
    if let Some(authority) = parts.uri.authority() {
        headers.set("host", authority.as_str());
    }
    for (name, value) in parts.headers.iter() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        let value = match headers.get(name.as_str()) {
            // Split cookie fields are joined back (RFC 9113 §8.2.3).
            Some(previous) if *name == COOKIE => format!("{previous}; {value}"),
            _ => value,
        };
        headers.set(name.as_str(), value);
    }

    let mut caller = remote_addr;
    if ctx.behind_proxy {
        if let Some(ip) = forwarded_for(&headers) {
            caller = SocketAddr::new(ip, remote_addr.port());
        }
    }

    let has_body = headers.contains("content-length")
        || headers.contains("transfer-encoding")
        || !recv.is_end_stream();
    let expects_continue = headers
        .get("expect")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));
    let content_codings: Vec<String> = headers
        .tokens("content-encoding")
        .chain(headers.tokens("x-content-encoding"))
        .map(str::to_ascii_lowercase)
        .collect();

    let mut req = Request::new(
        Protocol::Http2,
        parts.method.as_str().to_string(),
        target,
        Version::HTTP_2,
        headers,
        caller,
    );

    let headers_sent = Arc::new(AtomicBool::new(false));
    let mut unsupported = None;
    if has_body {
        let expect = expects_continue.then(|| (Arc::clone(&respond), Arc::clone(&headers_sent)));
        let reader: BoxedReader = Box::new(H2BodyReader::new(recv, expect));
        match decode_content_codings(reader, &content_codings) {
            Ok(reader) => req.set_body(Some(reader)),
            Err(coding) => unsupported = Some(coding),
        }
    }

    let sink = Sink::Http2(H2Sink::new(Arc::clone(&respond), Arc::clone(&headers_sent)));
    let mut res = Response::new(&req, sink, ctx.gzip_level, ctx.max_websocket_frame);

    let result = match unsupported {
        Some(coding) => res
            .send_text(StatusCode::NOT_IMPLEMENTED, format!("unsupported content-coding '{coding}'"))
            .await
            .map(|_| ()),
        None => ctx.dispatcher.dispatch(&mut req, &mut res).await.map(|_| ()),
    };

    if let Err(err) = result {
        if err.is_transient() || err.status_code().is_some() {
            tracing::debug!(error = %err, "HTTP/2 stream aborted");
        } else {
            tracing::error!(error = %err, "HTTP/2 stream failed");
        }
        lock(&respond).send_reset(Reason::INTERNAL_ERROR);
        return;
    }

    if let Err(err) = req.drain_body().await {
        tracing::trace!(error = %err, "Request body drain failed");
    }
}

/// The HTTP/2 side of a [`Response`].
pub(crate) struct H2Sink {
    respond: Responder,
    headers_sent: Arc<AtomicBool>,
}

impl H2Sink {
    pub(crate) fn new(respond: Responder, headers_sent: Arc<AtomicBool>) -> Self {
        Self {
            respond,
            headers_sent,
        }
    }

    /// Send the HEADERS frame and return the body stage for `plan`.
    pub(crate) fn start(&mut self, head: &mut ResponseHead, plan: BodyPlan) -> Result<BoxedWriter> {
        let forbids_body = status_forbids_body(head.status);
        let gzip = plan.gzip_level.filter(|_| !forbids_body);
        let length = plan.length.filter(|_| gzip.is_none() && !forbids_body);

        let mut response = ::http::Response::new(());
        *response.status_mut() = head.status;
        let map = response.headers_mut();
        for (name, value) in head.headers.iter() {
            let name = name.to_ascii_lowercase();
            if CONNECTION_SPECIFIC.contains(&name.as_str()) || name == "content-length" {
                continue;
            }
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::debug!(header = %name, "Dropping header not representable in HTTP/2"),
            }
        }
        if !map.contains_key(SERVER) {
            map.insert(SERVER, HeaderValue::from_static(SERVER_NAME));
        }
        if gzip.is_some() {
            map.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            if !map.contains_key(VARY) {
                map.insert(VARY, HeaderValue::from_static("accept-encoding"));
            }
        }
        if let Some(length) = length {
            map.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }

        let end_of_stream = forbids_body || plan.suppress_body || length == Some(0);
        self.headers_sent.store(true, Ordering::SeqCst);
        let stream = lock(&self.respond).send_response(response, end_of_stream)?;

        if end_of_stream {
            return Ok(Box::new(Discard::new(tokio::io::sink())));
        }
        let writer = H2BodyWriter::new(stream, length);
        Ok(match gzip {
            Some(level) => Box::new(GzipWriter::new(writer, level)),
            None => Box::new(writer),
        })
    }
}

const PAD: [u8; 1024] = [0u8; 1024];

/// DATA frames for one response, sent as flow-control capacity allows.
///
/// A declared length is enforced the same way as on HTTP/1.x: excess bytes
/// are dropped and a short body is padded on shutdown. Shutdown ends the
/// stream with an empty END_STREAM frame.
struct H2BodyWriter {
    stream: SendStream<Bytes>,
    remaining: Option<u64>,
    ended: bool,
}

impl H2BodyWriter {
    fn new(stream: SendStream<Bytes>, length: Option<u64>) -> Self {
        Self {
            stream,
            remaining: length,
            ended: false,
        }
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.stream.reserve_capacity(buf.len());
        loop {
            let capacity = self.stream.capacity();
            if capacity > 0 {
                let n = capacity.min(buf.len());
                self.stream
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(h2_io_error)?;
                return Poll::Ready(Ok(n));
            }
            match ready!(self.stream.poll_capacity(cx)) {
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Poll::Ready(Err(h2_io_error(err))),
                None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            }
        }
    }
}

impl AsyncWrite for H2BodyWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.ended {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "HTTP/2 body already ended",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let max = match self.remaining {
            Some(0) => return Poll::Ready(Ok(buf.len())),
            Some(remaining) => remaining.min(buf.len() as u64) as usize,
            None => buf.len(),
        };
        let n = ready!(self.poll_send(cx, &buf[..max]))?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= n as u64;
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the connection task as soon as they are sent.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.ended {
            return Poll::Ready(Ok(()));
        }
        while let Some(remaining) = self.remaining.filter(|r| *r > 0) {
            let max = remaining.min(PAD.len() as u64) as usize;
            let n = ready!(self.poll_send(cx, &PAD[..max]))?;
            self.remaining = Some(remaining - n as u64);
        }
        self.stream
            .send_data(Bytes::new(), true)
            .map_err(h2_io_error)?;
        self.ended = true;
        Poll::Ready(Ok(()))
    }
}

/// Request body read from DATA frames.
///
/// With `Expect: 100-continue` the interim `:status 100` HEADERS frame is
/// sent on the first read, unless the final response already went out.
struct H2BodyReader {
    recv: RecvStream,
    chunk: Bytes,
    expect: Option<(Responder, Arc<AtomicBool>)>,
    done: bool,
}

impl H2BodyReader {
    fn new(recv: RecvStream, expect: Option<(Responder, Arc<AtomicBool>)>) -> Self {
        Self {
            recv,
            chunk: Bytes::new(),
            expect,
            done: false,
        }
    }

    fn send_continue(&mut self) {
        let Some((respond, headers_sent)) = self.expect.take() else {
            return;
        };
        if headers_sent.load(Ordering::SeqCst) {
            return;
        }
        let mut interim = ::http::Response::new(());
        *interim.status_mut() = StatusCode::CONTINUE;
        let sent = lock(&respond).send_informational(interim);
        if let Err(err) = sent {
            tracing::debug!(error = %err, "Failed to send 100 Continue");
        }
    }
}

impl AsyncRead for H2BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.send_continue();
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.chunk = data;
                }
                Some(Err(err)) => return Poll::Ready(Err(h2_io_error(err))),
                None => this.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ConnectionMode;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn body_writer_pads_declared_length() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut conn = ::h2::server::handshake(server_io).await.unwrap();
            let (request, respond) = conn.accept().await.unwrap().unwrap();
            let respond = Arc::new(Mutex::new(respond));
            let mut sink = H2Sink::new(Arc::clone(&respond), Arc::new(AtomicBool::new(false)));
            let mut head = ResponseHead {
                status: StatusCode::OK,
                reason: None,
                headers: Headers::new(),
                version: Version::HTTP_2,
                mode: ConnectionMode::KeepAlive,
            };
            head.headers.set("Connection", "keep-alive");
            let plan = BodyPlan {
                length: Some(6),
                gzip_level: None,
                suppress_body: false,
            };
            let mut body = sink.start(&mut head, plan).unwrap();
            body.write_all(b"abc").await.unwrap();
            body.shutdown().await.unwrap();
            drop(request);
            // Keep the connection polled until the client has read everything.
            let _ = conn.accept().await;
        });

        let (mut client, connection) = ::h2::client::handshake(client_io).await.unwrap();
        tokio::spawn(async move {
            let _ = connection.await;
        });
        let request = ::http::Request::get("http://test/pad").body(()).unwrap();
        let (response, _) = client.send_request(request, true).unwrap();
        let response = response.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "6");
        assert!(response.headers().get("connection").is_none());
        assert_eq!(response.headers()[SERVER], SERVER_NAME);

        let mut body = response.into_body();
        let mut data = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.unwrap();
            let _ = body.flow_control().release_capacity(chunk.len());
            data.extend_from_slice(&chunk);
        }
        assert_eq!(data, b"abc\0\0\0");
        drop(body);
        drop(client);
        let _ = server.await;
    }
}
