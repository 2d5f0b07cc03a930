//! HTTP/1.x response writer.
//!
//! # Responsibilities
//! - Serialize the status line and header block exactly once
//! - Pick the body framing: fixed length, chunked, or close-delimited
//! - Layer gzip on top of the framing stage when negotiated
//! - Send the deferred `100 Continue` the first time a body is read
//!
//! # Design Decisions
//! - The head is written into the connection's write buffer and only
//!   flushed with the body or on close, so small responses go out in one
//!   segment
//! - A compressed body has no known length; it is framed as chunked (or
//!   close-delimited for peers that cannot take chunked)

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::body::{
    BoxedWriter, ChunkedWriter, Discard, GzipWriter, LengthLimitedWriter, Unframed,
};
use crate::http::response::{BodyPlan, ResponseHead};
use crate::http::{ConnectionMode, ConnectionOutcome, Headers, Version};
use crate::net::{BoxedIo, Rewind, Wire, WireWriter};

/// Value of the `Server` header unless a handler sets its own.
pub const SERVER_NAME: &str = "wirehttp";

/// Canonical reason phrase for `status`, `"Unknown"` for unregistered codes.
pub fn reason_phrase(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown")
}

/// True for statuses that never carry a body.
pub fn status_forbids_body(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Serialize a status line plus header block, ending with the blank line.
pub fn serialize_head(version: Version, status: StatusCode, reason: &str, headers: &Headers) -> Vec<u8> {
    let mut head = format!("{} {} {}\r\n", version, status.as_u16(), reason).into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Answer a request that never became a [`crate::http::Request`] and close
/// the connection.
pub(crate) async fn write_error_response(wire: &Wire, status: StatusCode, message: &str) -> io::Result<()> {
    let mut headers = Headers::new();
    headers.set("Server", SERVER_NAME);
    headers.set("Content-Type", "text/plain; charset=utf-8");
    headers.set("Content-Length", message.len().to_string());
    headers.set("Connection", "close");

    let mut bytes = serialize_head(Version::HTTP_11, status, reason_phrase(status), &headers);
    bytes.extend_from_slice(message.as_bytes());

    let mut writer = wire.writer();
    writer.write_all(&bytes).await?;
    wire.shutdown().await
}

enum Framing {
    Empty,
    Fixed(u64),
    Chunked,
    CloseDelimited,
}

/// The HTTP/1.x side of a [`crate::http::Response`].
pub(crate) struct Http1Sink {
    wire: Wire,
    headers_sent: Arc<AtomicBool>,
    /// Peer sent `TE` or speaks HTTP/1.1+.
    chunked_ok: bool,
}

impl Http1Sink {
    pub(crate) fn new(wire: Wire, headers_sent: Arc<AtomicBool>, chunked_ok: bool) -> Self {
        Self {
            wire,
            headers_sent,
            chunked_ok,
        }
    }

    /// Write the head and return the body stage for `plan`.
    pub(crate) async fn start(&mut self, head: &mut ResponseHead, plan: BodyPlan) -> io::Result<BoxedWriter> {
        let headers = &mut head.headers;
        if !headers.contains("server") {
            headers.set("Server", SERVER_NAME);
        }

        let gzip = plan.gzip_level.filter(|_| !status_forbids_body(head.status));
        if gzip.is_some() {
            headers.set("Content-Encoding", "gzip");
            if !headers.contains("vary") {
                headers.set("Vary", "Accept-Encoding");
            }
        }

        headers.remove("content-length");
        headers.remove("transfer-encoding");
        let framing = if status_forbids_body(head.status) {
            Framing::Empty
        } else {
            match plan.length.filter(|_| gzip.is_none()) {
                Some(length) => {
                    headers.set("Content-Length", length.to_string());
                    Framing::Fixed(length)
                }
                None if self.chunked_ok => {
                    headers.set("Transfer-Encoding", "chunked");
                    Framing::Chunked
                }
                None => {
                    head.mode = ConnectionMode::Close;
                    Framing::CloseDelimited
                }
            }
        };

        head.headers.set(
            "Connection",
            match head.mode {
                ConnectionMode::KeepAlive => "keep-alive",
                ConnectionMode::Close => "close",
            },
        );

        self.write_head(head).await?;

        let wire = self.wire.writer();
        let writer: BoxedWriter = match framing {
            _ if plan.suppress_body => Box::new(Discard::new(wire)),
            Framing::Empty => Box::new(Discard::new(wire)),
            Framing::Fixed(length) => Box::new(LengthLimitedWriter::new(wire, length)),
            Framing::Chunked => Box::new(ChunkedWriter::new(wire)),
            Framing::CloseDelimited => Box::new(Unframed::new(wire)),
        };

        Ok(match gzip {
            Some(level) if !plan.suppress_body => Box::new(GzipWriter::new(writer, level)),
            _ => writer,
        })
    }

    /// Serialize `head` as-is, without touching framing headers.
    pub(crate) async fn write_head(&mut self, head: &ResponseHead) -> io::Result<()> {
        self.headers_sent.store(true, Ordering::SeqCst);
        let bytes = serialize_head(head.version, head.status, head.reason(), &head.headers);
        self.wire.writer().write_all(&bytes).await
    }

    /// Flush, and close the connection when the exchange ends in close mode.
    pub(crate) async fn finish(&mut self, mode: ConnectionMode) -> io::Result<ConnectionOutcome> {
        match mode {
            ConnectionMode::KeepAlive => {
                self.wire.writer().flush().await?;
                Ok(ConnectionOutcome::Continue)
            }
            ConnectionMode::Close => {
                self.wire.shutdown().await?;
                Ok(ConnectionOutcome::Close)
            }
        }
    }

    pub(crate) async fn detach(&mut self) -> io::Result<Option<Rewind<BoxedIo>>> {
        self.wire.detach().await
    }
}

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

enum ContinueState {
    Pending(usize),
    Flushing,
    Done,
}

/// Bottom request-body stage for `Expect: 100-continue`.
///
/// The interim response goes out on the first read, unless the final
/// response has already started.
pub(crate) struct ExpectContinue<R> {
    inner: R,
    writer: WireWriter,
    headers_sent: Arc<AtomicBool>,
    state: ContinueState,
}

impl<R> ExpectContinue<R> {
    pub(crate) fn new(inner: R, writer: WireWriter, headers_sent: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            writer,
            headers_sent,
            state: ContinueState::Pending(0),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExpectContinue<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match this.state {
                ContinueState::Pending(_) if this.headers_sent.load(Ordering::SeqCst) => {
                    this.state = ContinueState::Done;
                }
                ContinueState::Pending(written) => {
                    let n = ready!(Pin::new(&mut this.writer).poll_write(cx, &CONTINUE[written..]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    this.state = if written + n == CONTINUE.len() {
                        tracing::trace!("Sent 100 Continue");
                        ContinueState::Flushing
                    } else {
                        ContinueState::Pending(written + n)
                    };
                }
                ContinueState::Flushing => {
                    ready!(Pin::new(&mut this.writer).poll_flush(cx))?;
                    this.state = ContinueState::Done;
                }
                ContinueState::Done => return Pin::new(&mut this.inner).poll_read(cx, buf),
            }
        }
    }
}
