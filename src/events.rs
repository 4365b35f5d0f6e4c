//! Inbound event fan-out (spec §9 Design Notes): a tagged variant delivered
//! to subscribers, deliberately not a class hierarchy. Subscribers receive
//! immutable values and never hold a handle back into the client.

use crate::codec::DecodeError;
use crate::ports::{PortPayload, TacticalEvent};
use crate::tracker::TxOutcome;
use crate::transport::TransportErrorKind;
use crate::types::{AppDataPacket, DeviceInfo, MessageEntry, TeamState};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    StateChanged {
        state: ClientState,
        last_error: Option<String>,
    },
    Ready {
        device_info: DeviceInfo,
    },
    TxResult {
        outcome: TxOutcome,
    },
    DecodeError(DecodeError),
    TransportError(TransportErrorKind, String),
    Status(Vec<u8>),
    Device(Vec<u8>),
    Gps(Vec<u8>),
    Position(Vec<u8>),
    NodeInfo(Vec<u8>),
    TeamState(TeamState),
    /// `parsed` is `None` when the payload was too short to decode; `raw` is
    /// always kept so a subscriber can still log or forward it.
    Tactical {
        parsed: Option<TacticalEvent>,
        raw: Vec<u8>,
    },
    IncomingMessage(MessageEntry),
    AppData {
        packet: AppDataPacket,
        decoded: PortPayload,
    },
    /// Recognised event type whose payload we don't otherwise interpret; kept
    /// distinct from `Unknown` so subscribers can tell "logged and ignored"
    /// apart from "not even a known frame type".
    Unknown {
        frame_type: u8,
    },
}
