// src/protocol/mod.rs

//! Wire protocol spoken with the kernel bridge.
//!
//! Newline-delimited JSON objects, one message per line, over the bridge's
//! standard streams.
//!
//! - [`messages`] defines the outbound and inbound message sum types.
//! - [`framing`] splits the raw byte stream into lines and classifies them
//!   into messages, diagnostic noise, or decode failures.

pub mod framing;
pub mod messages;

pub use framing::{decode_batch, encode_line, Frame, LineFramer};
pub use messages::{Inbound, Outbound};
