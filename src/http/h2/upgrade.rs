//! HTTP/1.1 → HTTP/2 promotion.
//!
//! # Prior knowledge
//! The client's `PRI * HTTP/2.0` line and its empty header block have
//! already been parsed as if they were HTTP/1.x. What is left of the preface
//! (`SM\r\n\r\n`) is verified here and the whole preface is put back in front
//! of the stream, so the `h2` server sees an untouched connection.
//!
//! # Cleartext upgrade (h2c)
//! ```text
//! client                                server
//!   GET / HTTP/1.1 + Upgrade: h2c  ──►
//!                                  ◄──  101 Switching Protocols
//!   preface + SETTINGS             ──►  verified, then replayed as:
//!                                       preface + SETTINGS
//!                                       + HEADERS(stream 1) [+ CONTINUATION]
//!                                       + DATA(stream 1)*
//! ```
//! The upgrading request becomes stream 1. The `h2` server only accepts
//! streams it receives as frames, so the request is re-encoded as a
//! synthetic HEADERS frame (HPACK literals, no table, no Huffman) and its
//! buffered body as DATA frames, spliced in right after the client's
//! SETTINGS frame.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{HttpError, Result};
use crate::http::h1::writer::serialize_head;
use crate::http::{Headers, Request, Version};
use crate::net::{BoxedIo, Rewind, Wire};

/// The fixed client connection preface.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// What follows `PRI * HTTP/2.0\r\n\r\n` once the request line and empty
/// header block have been consumed.
const PREFACE_TAIL: &[u8] = b"SM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
/// Default SETTINGS_MAX_FRAME_SIZE; the server never advertises more.
const MAX_FRAME_SIZE: usize = 16_384;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_ACK: u8 = 0x1;

/// Header fields that are meaningless (or forbidden) inside HTTP/2.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "http2-settings",
    "host",
];

/// Decode an `HTTP2-Settings` value: base64url of a SETTINGS payload.
///
/// Padding is tolerated. An empty value is a valid empty payload. Returns
/// `None` unless the payload is a whole number of 6-byte settings.
pub fn decode_settings_header(value: &str) -> Option<Vec<u8>> {
    let value = value.trim().trim_end_matches('=');
    let payload = URL_SAFE_NO_PAD.decode(value).ok()?;
    (payload.len() % 6 == 0).then_some(payload)
}

fn protocol_error(message: &str) -> HttpError {
    HttpError::bad_request(format!("HTTP/2 preface: {message}"))
}

/// Finish consuming a prior-knowledge preface and hand back the raw stream
/// with the complete preface replayed in front of it.
pub(crate) async fn accept_prior_knowledge(wire: &Wire) -> Result<Rewind<BoxedIo>> {
    let mut tail = [0u8; PREFACE_TAIL.len()];
    wire.reader().read_exact(&mut tail).await?;
    if &tail[..] != PREFACE_TAIL {
        return Err(protocol_error("malformed connection preface"));
    }
    let mut io = detach(wire).await?;
    io.rewind(Bytes::from_static(PREFACE));
    Ok(io)
}

/// Answer an h2c upgrade request with `101`, read the client preface and
/// return a stream that replays the upgrading request as stream 1.
pub(crate) async fn accept_h2c(wire: &Wire, req: &Request, body: Bytes) -> Result<Rewind<BoxedIo>> {
    let mut headers = Headers::new();
    headers.set("Connection", "Upgrade");
    headers.set("Upgrade", "h2c");
    let head = serialize_head(
        Version::HTTP_11,
        StatusCode::SWITCHING_PROTOCOLS,
        "Switching Protocols",
        &headers,
    );
    let mut writer = wire.writer();
    writer.write_all(&head).await?;
    writer.flush().await?;

    let mut reader = wire.reader();
    let mut preface = [0u8; PREFACE.len()];
    reader.read_exact(&mut preface).await?;
    if &preface != PREFACE {
        return Err(protocol_error("client did not send the connection preface"));
    }
    let settings = read_settings_frame(&mut reader).await?;

    let mut replay = BytesMut::with_capacity(PREFACE.len() + settings.len() + 256 + body.len());
    replay.extend_from_slice(PREFACE);
    replay.extend_from_slice(&settings);
    encode_stream_one(&mut replay, req, &body);

    let mut io = detach(wire).await?;
    io.rewind(replay.freeze());
    tracing::debug!(body_len = body.len(), "Upgraded connection to h2c");
    Ok(io)
}

async fn detach(wire: &Wire) -> Result<Rewind<BoxedIo>> {
    wire.detach()
        .await?
        .ok_or_else(|| HttpError::Io(std::io::ErrorKind::NotConnected.into()))
}

/// Read the client's first frame, which must be a non-ACK SETTINGS frame,
/// and return it verbatim (header included).
async fn read_settings_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let kind = header[3];
    let flags = header[4];
    let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff;

    if kind != FRAME_SETTINGS || flags & FLAG_ACK != 0 || stream_id != 0 {
        return Err(protocol_error("first frame is not SETTINGS"));
    }
    if length % 6 != 0 || length > MAX_FRAME_SIZE {
        return Err(protocol_error("malformed SETTINGS frame"));
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + length);
    frame.extend_from_slice(&header);
    frame.resize(FRAME_HEADER_LEN + length, 0);
    reader.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
    Ok(frame.freeze())
}

fn put_frame_header(buf: &mut BytesMut, length: usize, kind: u8, flags: u8, stream_id: u32) {
    let len = length as u32;
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

/// HPACK integer with an `n`-bit prefix (RFC 7541 §5.1); the high bits of
/// the first byte are `first`.
fn put_hpack_int(buf: &mut Vec<u8>, first: u8, prefix_bits: u8, mut value: usize) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.push(first | value as u8);
        return;
    }
    buf.push(first | max as u8);
    value -= max;
    while value >= 128 {
        buf.push((value % 128) as u8 | 0x80);
        value /= 128;
    }
    buf.push(value as u8);
}

/// Literal header field without indexing, new name (RFC 7541 §6.2.2).
fn put_literal(block: &mut Vec<u8>, name: &str, value: &str) {
    block.push(0x00);
    put_hpack_int(block, 0x00, 7, name.len());
    block.extend_from_slice(name.as_bytes());
    put_hpack_int(block, 0x00, 7, value.len());
    block.extend_from_slice(value.as_bytes());
}

fn header_block(req: &Request) -> Vec<u8> {
    let mut block = Vec::new();
    put_literal(&mut block, ":method", req.method());
    put_literal(&mut block, ":scheme", "http");
    let path = match req.query() {
        _ if req.target().starts_with('/') => req.target().to_string(),
        Some(query) => format!("{}?{}", req.path(), query),
        None => req.path().to_string(),
    };
    put_literal(&mut block, ":path", &path);
    if let Some(host) = req.header("host") {
        put_literal(&mut block, ":authority", host);
    }
    for (name, value) in req.headers().iter() {
        let name = name.to_ascii_lowercase();
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        put_literal(&mut block, &name, value);
    }
    block
}

/// Append the upgrading request as HEADERS (+ CONTINUATION) and DATA frames
/// on stream 1.
fn encode_stream_one(buf: &mut BytesMut, req: &Request, body: &[u8]) {
    let block = header_block(req);
    let mut fragments = block.chunks(MAX_FRAME_SIZE).peekable();
    let mut kind = FRAME_HEADERS;
    while let Some(fragment) = fragments.next() {
        let mut flags = 0;
        if fragments.peek().is_none() {
            flags |= FLAG_END_HEADERS;
        }
        if kind == FRAME_HEADERS && body.is_empty() {
            flags |= FLAG_END_STREAM;
        }
        put_frame_header(buf, fragment.len(), kind, flags, 1);
        buf.extend_from_slice(fragment);
        kind = FRAME_CONTINUATION;
    }

    let mut chunks = body.chunks(MAX_FRAME_SIZE).peekable();
    while let Some(chunk) = chunks.next() {
        let flags = if chunks.peek().is_none() { FLAG_END_STREAM } else { 0 };
        put_frame_header(buf, chunk.len(), FRAME_DATA, flags, 1);
        buf.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Protocol;

    fn upgrade_request(target: &str, extra: &[(&str, &str)]) -> Request {
        let mut headers = Headers::new();
        headers.set("host", "example.test");
        headers.set("connection", "Upgrade, HTTP2-Settings");
        headers.set("upgrade", "h2c");
        headers.set("http2-settings", "");
        for (n, v) in extra {
            headers.set(*n, *v);
        }
        Request::new(
            Protocol::Http1,
            "POST".into(),
            target.into(),
            Version::HTTP_11,
            headers,
            "127.0.0.1:1".parse().unwrap(),
        )
    }

    #[test]
    fn settings_header_validation() {
        // SETTINGS_MAX_CONCURRENT_STREAMS = 100, SETTINGS_INITIAL_WINDOW_SIZE = 65535
        let payload = decode_settings_header("AAMAAABkAAQAAP__").unwrap();
        assert_eq!(payload, [0, 3, 0, 0, 0, 100, 0, 4, 0, 0, 0xff, 0xff]);
        assert_eq!(decode_settings_header("AAMAAABkAAQAAP__==").unwrap().len(), 12);
        assert_eq!(decode_settings_header("").unwrap(), Vec::<u8>::new());
        assert!(decode_settings_header("AAMAA").is_none());
        assert!(decode_settings_header("AAMA/ABk").is_none());
    }

    #[test]
    fn hpack_integers_use_continuation_bytes() {
        let mut out = Vec::new();
        put_hpack_int(&mut out, 0, 7, 10);
        assert_eq!(out, [10]);

        out.clear();
        put_hpack_int(&mut out, 0, 5, 1337);
        // RFC 7541 C.1.2
        assert_eq!(out, [31, 154, 10]);

        out.clear();
        put_hpack_int(&mut out, 0, 7, 127);
        assert_eq!(out, [127, 0]);
    }

    #[test]
    fn stream_one_carries_pseudo_headers_and_body() {
        let req = upgrade_request("/submit", &[("content-length", "5"), ("te", "gzip")]);
        let mut buf = BytesMut::new();
        encode_stream_one(&mut buf, &req, b"hello");

        assert_eq!(buf[3], FRAME_HEADERS);
        assert_eq!(buf[4], FLAG_END_HEADERS);
        assert_eq!(&buf[5..9], &[0, 0, 0, 1]);
        let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
        let block = &buf[9..9 + len];
        let text = String::from_utf8_lossy(block);
        assert!(text.contains(":method") && text.contains("POST"));
        assert!(text.contains(":path") && text.contains("/submit"));
        assert!(text.contains(":authority") && text.contains("example.test"));
        assert!(text.contains("content-length"));
        assert!(!text.contains("upgrade"));
        assert!(!text.contains("http2-settings"));
        assert!(!text.contains("te\x04gzip"));

        let data = &buf[9 + len..];
        assert_eq!(&data[..9], &[0, 0, 5, FRAME_DATA, FLAG_END_STREAM, 0, 0, 0, 1]);
        assert_eq!(&data[9..], b"hello");
    }

    #[test]
    fn bodyless_stream_ends_on_headers() {
        let req = upgrade_request("/", &[]);
        let mut buf = BytesMut::new();
        encode_stream_one(&mut buf, &req, b"");
        assert_eq!(buf[4], FLAG_END_HEADERS | FLAG_END_STREAM);
        let len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
        assert_eq!(buf.len(), FRAME_HEADER_LEN + len);
    }

    #[test]
    fn oversized_header_block_uses_continuation() {
        let big = "v".repeat(MAX_FRAME_SIZE + 100);
        let req = upgrade_request("/", &[("x-big", big.as_str())]);
        let mut buf = BytesMut::new();
        encode_stream_one(&mut buf, &req, b"");

        let first_len = u32::from_be_bytes([0, buf[0], buf[1], buf[2]]) as usize;
        assert_eq!(first_len, MAX_FRAME_SIZE);
        assert_eq!(buf[4], FLAG_END_STREAM);
        let next = &buf[FRAME_HEADER_LEN + first_len..];
        assert_eq!(next[3], FRAME_CONTINUATION);
        assert_eq!(next[4], FLAG_END_HEADERS);
    }

    #[tokio::test]
    async fn settings_frame_must_come_first() {
        let mut ok: &[u8] = &[0, 0, 6, FRAME_SETTINGS, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 100];
        let frame = read_settings_frame(&mut ok).await.unwrap();
        assert_eq!(frame.len(), 15);

        let mut ping: &[u8] = &[0, 0, 8, 0x6, 0, 0, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        assert!(read_settings_frame(&mut ping).await.is_err());
    }

    #[tokio::test]
    async fn prior_knowledge_replays_full_preface() {
        let (server, mut client) = tokio::io::duplex(1024);
        let wire = Wire::new(Box::new(server));
        client.write_all(b"SM\r\n\r\nFRAMES").await.unwrap();

        let mut io = accept_prior_knowledge(&wire).await.unwrap();
        let mut replay = vec![0u8; PREFACE.len() + 6];
        io.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay[..24], PREFACE);
        assert_eq!(&replay[24..], b"FRAMES");
    }
}
