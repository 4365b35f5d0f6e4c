//! Fixed application-port constants and their payload decoders (spec §4.4,
//! §6). Port numbers multiplex sub-protocols inside reassembled `AppData`
//! payloads. Multi-byte integers are little-endian, matching the rest of the
//! wire protocol; coordinates are `int32` scaled by 1e7 (spec §9).

use crate::types::AppDataPacket;

pub const PORT_TEAM_TRACK: u32 = 0x1000_0001;
pub const PORT_TEAM_CHAT: u32 = 0x1000_0002;
pub const PORT_TEAM_POSITION: u32 = 0x1000_0003;
pub const PORT_TEAM_WAYPOINT: u32 = 0x1000_0004;

#[derive(Debug, Clone, PartialEq)]
pub struct PositionUpdate {
    pub node_id: u32,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: i32,
    pub timestamp_s: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TacticalEvent {
    pub node_id: u32,
    pub event_code: u16,
    pub lat: f64,
    pub lon: f64,
    pub detail: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub id: u32,
    pub lat: f64,
    pub lon: f64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortPayload {
    /// Team-Track carries the same fixed layout as Team-Position: a single
    /// node's latest position, used for live track lines on the map.
    TeamTrack(PositionUpdate),
    TeamChat(String),
    TeamPosition(PositionUpdate),
    TeamWaypoint(Waypoint),
    /// Any other portnum: handed back unparsed for the caller to ignore or log.
    Unknown(u32, Vec<u8>),
}

fn scaled_coord(raw: i32) -> f64 {
    raw as f64 / 1e7
}

fn decode_position(payload: &[u8]) -> Option<PositionUpdate> {
    if payload.len() < 16 {
        return None;
    }
    let node_id = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let lat_raw = i32::from_le_bytes(payload[4..8].try_into().ok()?);
    let lon_raw = i32::from_le_bytes(payload[8..12].try_into().ok()?);
    let altitude_m = i32::from_le_bytes(payload[12..16].try_into().ok()?);
    let timestamp_s = if payload.len() >= 20 {
        u32::from_le_bytes(payload[16..20].try_into().ok()?)
    } else {
        0
    };
    Some(PositionUpdate {
        node_id,
        lat: scaled_coord(lat_raw),
        lon: scaled_coord(lon_raw),
        altitude_m,
        timestamp_s,
    })
}

/// `EvTactical` is a direct wire event, not an AppData-reassembled port
/// payload — exposed as a top-level parser rather than dispatched through
/// [`decode`].
pub fn decode_tactical(payload: &[u8]) -> Option<TacticalEvent> {
    if payload.len() < 14 {
        return None;
    }
    let node_id = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let event_code = u16::from_le_bytes(payload[4..6].try_into().ok()?);
    let lat_raw = i32::from_le_bytes(payload[6..10].try_into().ok()?);
    let lon_raw = i32::from_le_bytes(payload[10..14].try_into().ok()?);
    Some(TacticalEvent {
        node_id,
        event_code,
        lat: scaled_coord(lat_raw),
        lon: scaled_coord(lon_raw),
        detail: payload[14..].to_vec(),
    })
}

fn decode_waypoint(payload: &[u8]) -> Option<Waypoint> {
    if payload.len() < 9 {
        return None;
    }
    let id = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let lat_raw = i32::from_le_bytes(payload[4..8].try_into().ok()?);
    let name_len = *payload.get(8)? as usize;
    if payload.len() < 9 + 4 + name_len {
        return None;
    }
    let lon_raw = i32::from_le_bytes(payload[9..13].try_into().ok()?);
    let name = String::from_utf8_lossy(&payload[13..13 + name_len]).into_owned();
    Some(Waypoint {
        id,
        lat: scaled_coord(lat_raw),
        lon: scaled_coord(lon_raw),
        name,
    })
}

/// Decodes a reassembled app-data packet by its portnum.
pub fn decode(packet: &AppDataPacket) -> PortPayload {
    match packet.portnum {
        PORT_TEAM_TRACK => decode_position(&packet.payload)
            .map(PortPayload::TeamTrack)
            .unwrap_or_else(|| PortPayload::Unknown(packet.portnum, packet.payload.clone())),
        PORT_TEAM_CHAT => PortPayload::TeamChat(String::from_utf8_lossy(&packet.payload).into_owned()),
        PORT_TEAM_POSITION => decode_position(&packet.payload)
            .map(PortPayload::TeamPosition)
            .unwrap_or_else(|| PortPayload::Unknown(packet.portnum, packet.payload.clone())),
        PORT_TEAM_WAYPOINT => decode_waypoint(&packet.payload)
            .map(PortPayload::TeamWaypoint)
            .unwrap_or_else(|| PortPayload::Unknown(packet.portnum, packet.payload.clone())),
        other => PortPayload::Unknown(other, packet.payload.clone()),
    }
}
