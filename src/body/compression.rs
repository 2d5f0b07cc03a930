//! Content-coding stages (gzip / deflate / identity).
//!
//! # Design Decisions
//! - `flate2`'s push-style (`write::`) codecs are driven from inside the
//!   poll functions; compressed or decompressed bytes land in a `Vec` and are
//!   then moved to or from the async stream.
//! - A decoder keeps reading its inner stage to EOF even after the
//!   compressed stream ends, so closing the outer stage drains everything
//!   beneath it.
//! - Corrupt input is reported once as an [`InvalidData`](io::ErrorKind)
//!   error tagged [`CorruptCoding`]. The decoder then turns into a plain
//!   discarding stage, so draining can still reach the end of the framing.
//! - `deflate` is the zlib format of RFC 7230 §4.2.2.

use std::fmt;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder};
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::BoxedReader;

/// A content-coding token from `Content-Encoding` / `Transfer-Encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Identity,
}

impl ContentCoding {
    /// Parse a single token; `x-gzip` is the legacy alias of `gzip`.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentCoding::Gzip),
            "deflate" => Some(ContentCoding::Deflate),
            "identity" => Some(ContentCoding::Identity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
            ContentCoding::Identity => "identity",
        }
    }

    /// Wrap `reader` in the decoder for this coding.
    pub fn decode(self, reader: BoxedReader) -> BoxedReader {
        match self {
            ContentCoding::Identity => reader,
            ContentCoding::Gzip => Box::new(DecoderReader::gzip(reader)),
            ContentCoding::Deflate => Box::new(DecoderReader::deflate(reader)),
        }
    }
}

/// Layer decoders for a `Content-Encoding` list, first listed innermost.
///
/// Returns the offending token if one is not supported.
pub fn decode_content_codings<S: AsRef<str>>(
    mut reader: BoxedReader,
    codings: &[S],
) -> Result<BoxedReader, String> {
    for token in codings {
        let coding = ContentCoding::parse(token.as_ref()).ok_or_else(|| token.as_ref().to_string())?;
        reader = coding.decode(reader);
    }
    Ok(reader)
}

/// Payload of the error a [`DecoderReader`] returns for undecodable input.
#[derive(Debug)]
pub struct CorruptCoding(String);

impl fmt::Display for CorruptCoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt content-coding: {}", self.0)
    }
}

impl std::error::Error for CorruptCoding {}

fn corrupt(detail: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, CorruptCoding(detail.to_string()))
}

/// True if `err` came from a decoder rejecting its input, as opposed to the
/// framing or the transport beneath it.
pub fn is_corrupt_coding(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<CorruptCoding>())
}

enum Decoder {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Decoder::Gzip(d) => d.write(data),
            Decoder::Deflate(d) => d.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Decoder::Gzip(d) => d.flush(),
            Decoder::Deflate(d) => d.flush(),
        }
    }

    fn try_finish(&mut self) -> io::Result<()> {
        match self {
            Decoder::Gzip(d) => d.try_finish(),
            Decoder::Deflate(d) => d.try_finish(),
        }
    }

    fn output(&mut self) -> &mut Vec<u8> {
        match self {
            Decoder::Gzip(d) => d.get_mut(),
            Decoder::Deflate(d) => d.get_mut(),
        }
    }
}

/// Decompresses a gzip or deflate body read from the inner stage.
pub struct DecoderReader<R> {
    inner: R,
    decoder: Decoder,
    out: Vec<u8>,
    pos: usize,
    stream_ended: bool,
    inner_eof: bool,
    failed: bool,
}

impl<R> DecoderReader<R> {
    pub fn gzip(inner: R) -> Self {
        Self::with_decoder(inner, Decoder::Gzip(GzDecoder::new(Vec::new())))
    }

    /// zlib-wrapped deflate, the `deflate` content-coding.
    pub fn deflate(inner: R) -> Self {
        Self::with_decoder(inner, Decoder::Deflate(ZlibDecoder::new(Vec::new())))
    }

    fn with_decoder(inner: R, decoder: Decoder) -> Self {
        Self {
            inner,
            decoder,
            out: Vec::new(),
            pos: 0,
            stream_ended: false,
            inner_eof: false,
            failed: false,
        }
    }

    /// Stop decoding; later reads only discard the inner stage.
    fn fail(&mut self, detail: impl fmt::Display) -> io::Error {
        self.failed = true;
        self.out.clear();
        self.pos = 0;
        corrupt(detail)
    }

    fn collect_output(&mut self) {
        let produced = std::mem::take(self.decoder.output());
        if self.pos == self.out.len() {
            self.out = produced;
            self.pos = 0;
        } else {
            self.out.extend_from_slice(&produced);
        }
    }

    fn feed(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() && !self.stream_ended {
            let n = self.decoder.write(data)?;
            if n == 0 {
                // Bytes after the end of the compressed stream are dropped.
                self.stream_ended = true;
                break;
            }
            data = &data[n..];
        }
        self.decoder.flush()?;
        self.collect_output();
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecoderReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.pos < this.out.len() {
                let n = (this.out.len() - this.pos).min(buf.remaining());
                buf.put_slice(&this.out[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            if this.inner_eof {
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; 8 * 1024];
            let mut read = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read))?;
            let n = read.filled().len();

            if n == 0 {
                this.inner_eof = true;
                if !this.stream_ended && !this.failed {
                    if let Err(e) = this.decoder.try_finish() {
                        return Poll::Ready(Err(this.fail(format_args!("truncated body: {e}"))));
                    }
                    this.collect_output();
                }
                continue;
            }

            if !this.stream_ended && !this.failed {
                if let Err(e) = this.feed(&chunk[..n]) {
                    return Poll::Ready(Err(this.fail(e)));
                }
            }
        }
    }
}

/// Compresses everything written into a gzip member on the inner stage.
///
/// Shutdown writes the gzip trailer and then shuts the inner stage down.
pub struct GzipWriter<W> {
    inner: W,
    encoder: GzEncoder<Vec<u8>>,
    pending: Vec<u8>,
    written: usize,
    finished: bool,
}

impl<W> GzipWriter<W> {
    pub fn new(inner: W, level: u32) -> Self {
        Self {
            inner,
            encoder: GzEncoder::new(Vec::new(), Compression::new(level.min(9))),
            pending: Vec::new(),
            written: 0,
            finished: false,
        }
    }

    fn take_encoded(&mut self) {
        let encoded = std::mem::take(self.encoder.get_mut());
        if self.written == self.pending.len() {
            self.pending = encoded;
            self.written = 0;
        } else {
            self.pending.extend_from_slice(&encoded);
        }
    }
}

impl<W: AsyncWrite + Unpin> GzipWriter<W> {
    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.pending.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for GzipWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "gzip body already finished",
            )));
        }
        ready!(this.poll_pending(cx))?;
        this.encoder.write_all(buf)?;
        this.take_encoded();
        if let Poll::Ready(Err(e)) = this.poll_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.finished {
            this.encoder.flush()?;
            this.take_encoded();
        }
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.finished {
            this.encoder.try_finish()?;
            this.take_encoded();
            this.finished = true;
        }
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
