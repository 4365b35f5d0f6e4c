#![forbid(unsafe_code)]

//! HostLink core: the framing, transport, and reconnecting client for the
//! HostLink mesh-radio serial protocol.
//!
//! - Wire framing and CRC (`codec`)
//! - Byte-stream transports, serial and replay (`transport`)
//! - Request tracking and app-data reassembly (`tracker`, `reassembler`)
//! - Fixed application ports and their payload decoders (`ports`)
//! - Team-chat wire-format negotiation (`teamchat`)
//! - The client state machine and its public handle (`client`)

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod ports;
pub mod reassembler;
pub mod teamchat;
pub mod tracker;
pub mod transport;
pub mod types;
pub mod wire;

pub use client::{spawn, ClientSnapshot, HostLinkHandle};
pub use config::ConnectOptions;
pub use error::{Error, Result};
pub use events::{ClientState, FrameEvent};
pub use transport::{ReplayTransport, SerialTransport, Transport, TransportEndpoint};
pub use types::{AppDataPacket, Capabilities, DeviceInfo, MessageEntry, MessageStatus, TeamState};
