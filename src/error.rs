//! Crate-wide error type.
//!
//! Decode and transport failures are recoverable by design (spec §7): most of
//! them never reach this type at all, they surface as [`crate::events::FrameEvent`]
//! values or as a terminal [`crate::types::MessageStatus`]. `Error` exists for the
//! handful of operations that have no better place to report failure: opening a
//! transport, a malformed team-chat conversation key, a handshake that never
//! completes.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(#[from] crate::codec::DecodeError),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("timeout")]
    Timeout,
    #[error("disconnected")]
    Disconnected,
    #[error("canceled")]
    Canceled,
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
