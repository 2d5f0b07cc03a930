//! RFC 6455 WebSocket support for connections handed off by
//! [`crate::http::Response::begin_websocket`].
//!
//! - [`handshake`]: upgrade validation and `Sec-WebSocket-Accept`
//! - [`frame`]: header codec and masking
//! - [`socket`]: the framer handlers talk to

pub mod frame;
pub mod handshake;
pub mod socket;

use std::io;

pub use frame::{apply_mask, FrameHeader, Opcode};
pub use handshake::{accept_key, Handshake, Rejection};
pub use socket::{Message, MessageKind, WebSocket};

/// Close status codes (RFC 6455 §7.4.1).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present in the received close frame.
    pub const NO_STATUS: u16 = 1005;
    pub const TOO_BIG: u16 = 1009;
}

/// Errors raised by the framer.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// The socket is closed: a close frame was exchanged, the peer went away
    /// mid-frame, or a previous call failed. Every later call fails the same way.
    #[error("WebSocket closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated framing rules; a `1002` close has been sent.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame payload of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: u64, limit: u64 },
}
