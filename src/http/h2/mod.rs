//! HTTP/2 support on top of the `h2` crate.
//!
//! - `upgrade`: prior-knowledge preface handling and the h2c `101` dance
//! - `adapter`: maps `h2` streams onto [`crate::http::Request`] /
//!   [`crate::http::Response`]

pub mod adapter;
pub mod upgrade;

pub use upgrade::{decode_settings_header, PREFACE};
