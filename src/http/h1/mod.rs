//! HTTP/1.0 and HTTP/1.1 wire format.
//!
//! `parser` turns bytes into a [`crate::http::Request`]; `writer` frames the
//! matching [`crate::http::Response`]. The keep-alive loop that ties them
//! together lives in `http::server`.

pub mod parser;
pub mod writer;

pub use parser::{ParseLimits, RequestLine};
