//! Chunked transfer-coding (RFC 7230 §4.1).

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::READ_CHUNK;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4096;

#[derive(Debug)]
enum ReadState {
    /// Reading a `<hex-size>[;ext]\r\n` line.
    Size,
    /// Inside chunk data.
    Data(u64),
    /// Expecting the CRLF that closes a chunk.
    DataEnd,
    /// Reading trailer lines until an empty one.
    Trailer,
    Done,
}

/// Decodes a chunked body, stopping exactly after the final trailer CRLF.
///
/// Framing lines are read one byte at a time so nothing beyond the body is
/// taken from the inner stream.
#[derive(Debug)]
pub struct ChunkedReader<R> {
    inner: R,
    state: ReadState,
    line: Vec<u8>,
}

impl<R> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ReadState::Size,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| invalid("chunk size is not ASCII"))?;
    let size = text.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(invalid("empty chunk size"));
    }
    u64::from_str_radix(size, 16).map_err(|_| invalid("malformed chunk size"))
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    fn poll_byte(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<u8>> {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut buf))?;
        if buf.filled().is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            )));
        }
        Poll::Ready(Ok(byte[0]))
    }

    /// Accumulate one line into `self.line`, without its line terminator.
    fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let byte = ready!(self.poll_byte(cx))?;
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                return Poll::Ready(Ok(()));
            }
            if self.line.len() >= MAX_LINE {
                return Poll::Ready(Err(invalid("chunk framing line too long")));
            }
            self.line.push(byte);
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChunkedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match this.state {
                ReadState::Size => {
                    ready!(this.poll_line(cx))?;
                    let size = parse_chunk_size(&this.line)?;
                    this.line.clear();
                    this.state = if size == 0 {
                        ReadState::Trailer
                    } else {
                        ReadState::Data(size)
                    };
                }
                ReadState::Data(remaining) => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let max = (remaining.min(READ_CHUNK as u64) as usize).min(buf.remaining());
                    let n = {
                        let dst = buf.initialize_unfilled_to(max);
                        let mut sub = ReadBuf::new(dst);
                        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut sub))?;
                        sub.filled().len()
                    };
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed inside chunk",
                        )));
                    }
                    buf.advance(n);
                    let left = remaining - n as u64;
                    this.state = if left == 0 {
                        ReadState::DataEnd
                    } else {
                        ReadState::Data(left)
                    };
                    return Poll::Ready(Ok(()));
                }
                ReadState::DataEnd => {
                    ready!(this.poll_line(cx))?;
                    if !this.line.is_empty() {
                        return Poll::Ready(Err(invalid("chunk data not followed by CRLF")));
                    }
                    this.state = ReadState::Size;
                }
                ReadState::Trailer => {
                    ready!(this.poll_line(cx))?;
                    let end = this.line.is_empty();
                    this.line.clear();
                    if end {
                        this.state = ReadState::Done;
                    }
                }
                ReadState::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Encodes writes as chunks: `<hex-length>\r\n<data>\r\n` per write, and the
/// zero-length terminator chunk on shutdown.
///
/// Shutdown flushes the inner stream but does not close it.
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    inner: W,
    pending: Vec<u8>,
    written: usize,
    finished: bool,
}

impl<W> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            written: 0,
            finished: false,
        }
    }
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
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

impl<W: AsyncWrite + Unpin> AsyncWrite for ChunkedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "chunked body already terminated",
            )));
        }
        ready!(this.poll_pending(cx))?;
        // An empty chunk would terminate the body.
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        this.pending.extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        this.pending.extend_from_slice(buf);
        this.pending.extend_from_slice(b"\r\n");
        if let Poll::Ready(Err(e)) = this.poll_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_pending(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.finished {
            self.finished = true;
            self.pending.extend_from_slice(b"0\r\n\r\n");
        }
        ready!(self.poll_pending(cx))?;
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn round_trip(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let mut encoded = Vec::new();
        let mut writer = ChunkedWriter::new(&mut encoded);
        for piece in payload.chunks(4000) {
            writer.write_all(piece).await.unwrap();
        }
        writer.shutdown().await.unwrap();
        encoded.extend_from_slice(b"GET /next");

        let mut reader = ChunkedReader::new(encoded.as_slice());
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, payload, "length {len}");
        assert!(reader.is_done());

        let mut rest = Vec::new();
        reader.into_inner().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET /next");
    }

    #[tokio::test]
    async fn round_trips_boundary_lengths() {
        for len in [0, 1, 125, 126, 65535, 65536] {
            round_trip(len).await;
        }
    }

    #[tokio::test]
    async fn writer_frames_each_write() {
        let mut out = Vec::new();
        let mut writer = ChunkedWriter::new(&mut out);
        writer.write_all(b"hello").await.unwrap();
        writer.write_all(&[b'x'; 26]).await.unwrap();
        writer.shutdown().await.unwrap();
        let expected = format!("5\r\nhello\r\n1a\r\n{}\r\n0\r\n\r\n", "x".repeat(26));
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[tokio::test]
    async fn reader_skips_extensions_and_trailers() {
        let wire: &[u8] = b"4;name=value\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
        let mut reader = ChunkedReader::new(wire);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "Wikipedia");
    }

    #[tokio::test]
    async fn reader_rejects_bad_size() {
        let wire: &[u8] = b"zz\r\nabc\r\n0\r\n\r\n";
        let mut reader = ChunkedReader::new(wire);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
