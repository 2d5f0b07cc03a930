//! wirehttp: an embeddable HTTP/1.x, HTTP/2 and WebSocket transport.
//!
//! Applications register handlers on a [`Dispatcher`] and hand it to an
//! [`HttpServer`]; handlers see only the protocol-neutral [`Request`] and
//! [`Response`].

pub mod body;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod websocket;

pub use crate::config::ServerConfig;
pub use crate::error::{HandlerError, HttpError};
pub use crate::http::{
    handler_fn, BoxFuture, ConnectionOutcome, Dispatcher, Handler, HttpServer, Request, Response,
};
pub use crate::lifecycle::Shutdown;
pub use crate::net::Listener;
pub use crate::websocket::{Message, MessageKind, WebSocket};
