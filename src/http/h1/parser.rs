//! HTTP/1.x request parsing.
//!
//! # Data Flow
//! ```text
//! wire → read_request_line → read_headers → build_request
//!                                              ├─ connection mode, Host, X-Forwarded-For
//!                                              ├─ body chain (Content-Length | Transfer-Encoding,
//!                                              │              then Content-Encoding)
//!                                              └─ upgrade flags (websocket, h2c)
//! ```
//!
//! # Design Decisions
//! - Lines are read a byte at a time off the buffered connection so the
//!   parser never consumes bytes that belong to the body
//! - Every fatal condition is an `HttpError::Status` carrying the most
//!   specific status known at that point
//! - Transfer and content codings wrap the body in header-list order, the
//!   first listed coding closest to the wire

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::writer::ExpectContinue;
use crate::body::{
    decode_content_codings, BoxedReader, ChunkedReader, ContentCoding, LengthLimitedReader,
    ReadTimeout,
};
use crate::error::{HttpError, Result};
use crate::http::h2::upgrade::decode_settings_header;
use crate::http::{ConnectionMode, Headers, Protocol, Request, Version};
use crate::net::Wire;

/// Size limits applied while reading a request head.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_request_line: usize,
    pub max_header_bytes: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_request_line: 8 * 1024,
            max_header_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: Version,
}

impl RequestLine {
    /// `PRI * HTTP/2.0`, the first line of the HTTP/2 connection preface.
    pub fn is_h2_preface(&self) -> bool {
        self.method == "PRI" && self.version == Version::HTTP_2
    }
}

enum Line {
    Text(Vec<u8>),
    Eof { partial: bool },
    TooLong,
}

async fn read_line<R>(reader: &mut R, max: usize) -> std::io::Result<Line>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte).await? == 0 {
            return Ok(Line::Eof {
                partial: !line.is_empty(),
            });
        }
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Line::Text(line));
        }
        // `max` counts content; the CR of the line ending may still follow.
        let line_end = byte[0] == b'\r' && line.len() == max;
        if line.len() >= max && !line_end {
            return Ok(Line::TooLong);
        }
        line.push(byte[0]);
    }
}

fn eof_inside(what: &str) -> HttpError {
    HttpError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("connection closed inside {what}"),
    ))
}

/// Read the next request line.
///
/// Returns `None` when the peer closes cleanly between requests. Blank
/// lines ahead of the request line are skipped.
pub async fn read_request_line<R>(reader: &mut R, limits: &ParseLimits) -> Result<Option<RequestLine>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        match read_line(reader, limits.max_request_line).await? {
            Line::Text(line) if line.is_empty() => continue,
            Line::Text(line) => {
                let line = String::from_utf8(line)
                    .map_err(|_| HttpError::bad_request("request line is not valid UTF-8"))?;
                return parse_request_line(&line).map(Some);
            }
            Line::Eof { partial: false } => return Ok(None),
            Line::Eof { partial: true } => return Err(eof_inside("request line")),
            Line::TooLong => return Err(HttpError::bad_request("request line too long")),
        }
    }
}

/// Split `METHOD target HTTP/x.y` and validate the version.
pub fn parse_request_line(line: &str) -> Result<RequestLine> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [method, target, version] = tokens[..] else {
        return Err(HttpError::bad_request("malformed request line"));
    };

    let version = Version::parse(version)
        .ok_or_else(|| HttpError::bad_request(format!("malformed HTTP version '{version}'")))?;
    if version.major != 1 && version.major != 2 {
        return Err(HttpError::status(
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            format!("unsupported protocol {version}"),
        ));
    }
    if !method.bytes().all(is_tchar) {
        return Err(HttpError::bad_request("malformed method"));
    }

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Read header lines up to the blank line that ends the block.
///
/// Names are lower-cased; a repeated name overwrites the earlier value,
/// except `Content-Length`, which must not disagree with itself.
pub async fn read_headers<R>(reader: &mut R, limits: &ParseLimits) -> Result<Headers>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let too_large = || {
        HttpError::status(
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            "header block too large",
        )
    };
    let mut headers = Headers::new();
    // Header lines with their CRLF count against the budget; the blank
    // line that ends the block does not.
    let mut budget = limits.max_header_bytes;
    let mut last_name: Option<String> = None;

    loop {
        let line = match read_line(reader, budget).await? {
            Line::Text(line) => line,
            Line::Eof { .. } => return Err(eof_inside("header block")),
            Line::TooLong => return Err(too_large()),
        };
        if line.is_empty() {
            return Ok(headers);
        }
        budget = budget.checked_sub(line.len() + 2).ok_or_else(too_large)?;
        let line = String::from_utf8(line)
            .map_err(|_| HttpError::bad_request("header line is not valid UTF-8"))?;

        if line.starts_with(|c| c == ' ' || c == '\t') {
            // obs-fold continuation of the previous header
            let folded = last_name
                .as_deref()
                .is_some_and(|name| headers.extend_value(name, &line));
            if !folded {
                return Err(HttpError::bad_request("continuation line before any header"));
            }
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request("header line without ':'"))?;
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return Err(HttpError::bad_request(format!("malformed header name '{name}'")));
        }
        let name = name.to_ascii_lowercase();
        let value = value.trim();

        if name == "content-length" {
            if let Some(previous) = headers.get("content-length") {
                if previous != value {
                    return Err(HttpError::bad_request("conflicting Content-Length headers"));
                }
            }
        }
        headers.set(name.clone(), value);
        last_name = Some(name);
    }
}

/// Per-connection inputs for turning a parsed head into a [`Request`].
pub(crate) struct RequestContext<'a> {
    pub wire: &'a Wire,
    pub headers_sent: &'a Arc<AtomicBool>,
    pub remote_addr: SocketAddr,
    pub tls: bool,
    pub behind_proxy: bool,
    pub h2c_body_limit: usize,
    /// Longest wait for the next body byte.
    pub read_timeout: Duration,
}

/// Apply connection semantics and build the body chain.
pub(crate) fn build_request(line: RequestLine, headers: Headers, ctx: &RequestContext<'_>) -> Result<Request> {
    let version = line.version;
    let mut req = Request::new(
        Protocol::Http1,
        line.method,
        line.target,
        version,
        headers,
        ctx.remote_addr,
    );
    let headers = req.headers();

    let mut mode = req.connection_mode();
    if headers.has_token("connection", "close") {
        mode = ConnectionMode::Close;
    } else if version == Version::HTTP_10 && headers.has_token("connection", "keep-alive") {
        mode = ConnectionMode::KeepAlive;
    }

    if version >= Version::HTTP_11 && !headers.contains("host") {
        return Err(HttpError::bad_request("missing Host header"));
    }

    let forwarded = if ctx.behind_proxy {
        forwarded_for(headers).map(|ip| SocketAddr::new(ip, ctx.remote_addr.port()))
    } else {
        None
    };

    let content_length = match headers.get("content-length") {
        Some(value) => Some(parse_content_length(value)?),
        None => None,
    };
    let transfer_codings: Vec<String> = headers
        .tokens("transfer-encoding")
        .map(str::to_ascii_lowercase)
        .collect();
    let content_codings: Vec<String> = headers
        .tokens("content-encoding")
        .chain(headers.tokens("x-content-encoding"))
        .map(str::to_ascii_lowercase)
        .collect();
    let expects_continue = version >= Version::HTTP_11
        && headers
            .get("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));

    let bottom = || -> BoxedReader {
        let reader = ReadTimeout::new(ctx.wire.reader(), ctx.read_timeout);
        if expects_continue {
            Box::new(ExpectContinue::new(
                reader,
                ctx.wire.writer(),
                Arc::clone(ctx.headers_sent),
            ))
        } else {
            Box::new(reader)
        }
    };

    let mut body: Option<BoxedReader> = None;
    if let Some(length) = content_length {
        if !transfer_codings.is_empty() {
            // Both framings present: trust Content-Length, never reuse the connection.
            mode = ConnectionMode::Close;
        }
        body = Some(if length == 0 {
            Box::new(tokio::io::empty())
        } else {
            Box::new(LengthLimitedReader::new(bottom(), length))
        });
    } else if !transfer_codings.is_empty() {
        let mut reader = bottom();
        for coding in &transfer_codings {
            reader = match coding.as_str() {
                "chunked" => Box::new(ChunkedReader::new(reader)),
                "gzip" | "x-gzip" => ContentCoding::Gzip.decode(reader),
                other => {
                    return Err(HttpError::not_implemented(format!(
                        "unsupported transfer-coding '{other}'"
                    )))
                }
            };
        }
        if !transfer_codings.iter().any(|c| c == "chunked") {
            // Body runs to the end of the connection.
            mode = ConnectionMode::Close;
        }
        body = Some(reader);
    }

    if let Some(reader) = body.take() {
        let reader = decode_content_codings(reader, &content_codings).map_err(|coding| {
            HttpError::not_implemented(format!("unsupported content-coding '{coding}'"))
        })?;
        body = Some(reader);
    }

    let upgrade_websocket =
        headers.has_token("upgrade", "websocket") && headers.has_token("connection", "upgrade");
    let upgrade_h2c = !ctx.tls
        && version == Version::HTTP_11
        && headers.has_token("upgrade", "h2c")
        && headers
            .get("http2-settings")
            .is_some_and(|v| decode_settings_header(v).is_some());
    let h2c_without_body = upgrade_h2c && body.is_none();
    let h2c_after_body = upgrade_h2c
        && transfer_codings.is_empty()
        && content_codings.is_empty()
        && content_length.is_some_and(|n| n <= ctx.h2c_body_limit as u64);

    req.set_connection_mode(mode);
    if let Some(addr) = forwarded {
        req.set_remote_addr(addr);
    }
    req.set_body(body);
    req.set_upgrade_flags(upgrade_websocket, h2c_without_body, h2c_after_body);
    Ok(req)
}

fn parse_content_length(value: &str) -> Result<u64> {
    // "5, 5" is tolerated when every element agrees.
    let mut parsed = None;
    for part in value.split(',').map(str::trim) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(HttpError::bad_request(format!("malformed Content-Length '{value}'")));
        }
        let n: u64 = part
            .parse()
            .map_err(|_| HttpError::bad_request("Content-Length out of range"))?;
        if parsed.is_some_and(|p| p != n) {
            return Err(HttpError::bad_request("conflicting Content-Length values"));
        }
        parsed = Some(n);
    }
    parsed.ok_or_else(|| HttpError::bad_request("empty Content-Length"))
}

/// First entry of `X-Forwarded-For` that parses as an IP address.
pub(crate) fn forwarded_for(headers: &Headers) -> Option<IpAddr> {
    headers
        .tokens("x-forwarded-for")
        .find_map(|entry| entry.parse::<IpAddr>().ok())
}
