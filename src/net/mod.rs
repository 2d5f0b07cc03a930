//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (admission permit, accept)
//!     → tls.rs (optional TLS handshake)
//!     → connection.rs (lifecycle tracking)
//!     → io.rs (boxed stream, shared read/write handles)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - A permit is taken before `accept()`, so a flood of connections waits in
//!   the kernel backlog instead of spawning unbounded tasks
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod io;
pub mod listener;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use io::{BoxedIo, Io, Rewind, Wire, WireReader, WireWriter};
pub use listener::{ConnectionPermit, Listener, ListenerError};
