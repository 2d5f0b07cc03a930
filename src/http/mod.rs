//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (protocol sniffing, keep-alive loop, h2 promotion)
//!     → h1/parser.rs | h2/adapter.rs (build a protocol-neutral Request)
//!     → dispatcher.rs (exact / content-type / prefix tables)
//!     → handler
//!     → response.rs (h1/writer.rs | h2/adapter.rs frame the reply)
//!     → Send to client
//! ```
//!
//! # Design Decisions
//! - `Request` and `Response` are concrete structs whose protocol-specific
//!   state is a tagged variant; handlers never see which generation is active
//! - Closing and hand-off are values ([`ConnectionOutcome`]), not errors

pub mod dispatcher;
pub mod h1;
pub mod h2;
pub mod headers;
pub mod request;
pub mod response;
pub mod server;

use std::fmt;

pub use dispatcher::{handler_fn, BoxFuture, Dispatcher, Handler};
pub use headers::Headers;
pub use request::{Request, RequestBody};
pub use response::{Response, ResponseBody};
pub use server::HttpServer;

/// What the connection loop should do once a response is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Parse the next request on the same connection.
    Continue,
    /// The connection has been closed; stop the loop.
    Close,
    /// A handler took over the raw stream; stop the loop without closing it.
    Detach,
}

/// Negotiated persistence of an HTTP/1.x connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    KeepAlive,
    Close,
}

/// Which protocol generation carried a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
}

impl Protocol {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http1",
            Protocol::Http2 => "http2",
        }
    }
}

/// HTTP protocol version as parsed from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const HTTP_10: Version = Version { major: 1, minor: 0 };
    pub const HTTP_11: Version = Version { major: 1, minor: 1 };
    pub const HTTP_2: Version = Version { major: 2, minor: 0 };

    /// Parse `HTTP/<major>.<minor>`.
    ///
    /// Digits beyond `u8` saturate, so `HTTP/300.0` is a well-formed but
    /// unsupported version rather than a malformed one.
    pub fn parse(token: &str) -> Option<Version> {
        let rest = token.strip_prefix("HTTP/")?;
        let (major, minor) = rest.split_once('.')?;
        if major.is_empty() || minor.is_empty() {
            return None;
        }
        if !major.bytes().all(|b| b.is_ascii_digit()) || !minor.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Version {
            major: major.parse().unwrap_or(u8::MAX),
            minor: minor.parse().unwrap_or(u8::MAX),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_tokens() {
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::HTTP_11));
        assert_eq!(Version::parse("HTTP/2.0"), Some(Version::HTTP_2));
        assert_eq!(Version::parse("HTTP/3.0"), Some(Version { major: 3, minor: 0 }));
        assert_eq!(Version::parse("HTTP/300.0"), Some(Version { major: 255, minor: 0 }));
        assert_eq!(Version::parse("HTTP/1"), None);
        assert_eq!(Version::parse("HTTP/+1.1"), None);
        assert_eq!(Version::parse("http/1.1"), None);
        assert_eq!(Version::HTTP_10.to_string(), "HTTP/1.0");
        assert!(Version::HTTP_10 < Version::HTTP_11);
    }
}
