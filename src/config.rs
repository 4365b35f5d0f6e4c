//! Connection configuration (spec §6 "CLI / configuration surface", expanded
//! per `SPEC_FULL.md` §2.3). Loading from a file or environment is a host
//! application's concern; this crate only defines the struct and its
//! defaults, the way `nyx_sdk::config::SdkConfig` does for its own client.

use crate::codec::DEFAULT_MAX_PAYLOAD_LEN;
use crate::transport::TransportEndpoint;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub endpoint: TransportEndpoint,
    /// How long to wait for an `Ack` before retrying a pending request.
    pub ack_timeout_ms: u64,
    /// Retries attempted before a pending request fails with `Timeout`.
    pub max_retries: u32,
    /// Delay before re-attempting `connect` after a transport error.
    pub reconnect_delay_ms: u64,
    /// Whether the client re-opens the transport automatically on error.
    pub auto_reconnect: bool,
    /// Deadline for the `Hello`/`HelloAck` exchange.
    pub handshake_timeout_ms: u64,
    /// Payload size ceiling used before the peer's `max_frame_len` is known.
    pub max_frame_len: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            endpoint: TransportEndpoint::Serial {
                port_name: String::new(),
                baud_rate: 115_200,
            },
            ack_timeout_ms: 2_000,
            max_retries: 3,
            reconnect_delay_ms: 1_000,
            auto_reconnect: true,
            handshake_timeout_ms: 5_000,
            max_frame_len: DEFAULT_MAX_PAYLOAD_LEN,
        }
    }
}
