//! Frame TYPE values, `Ack` error codes, and the fixed command/event payload
//! layouts named in spec §6.

pub mod frame_type {
    pub const HELLO: u8 = 0x01;
    pub const HELLO_ACK: u8 = 0x02;
    pub const ACK: u8 = 0x03;
    pub const CMD_TX_MSG: u8 = 0x10;
    pub const CMD_TX_APP_DATA: u8 = 0x11;
    pub const CMD_SET_TIME: u8 = 0x12;
    pub const CMD_GET_CONFIG: u8 = 0x13;
    pub const CMD_SET_CONFIG: u8 = 0x14;
    pub const CMD_TEAM_COMMAND: u8 = 0x15;
    pub const CMD_TEAM_LOCATION_POST: u8 = 0x16;
    pub const EV_STATUS: u8 = 0x20;
    pub const EV_DEVICE: u8 = 0x21;
    pub const EV_GPS: u8 = 0x22;
    pub const EV_POSITION: u8 = 0x23;
    pub const EV_NODE_INFO: u8 = 0x24;
    pub const EV_RX_MSG: u8 = 0x25;
    pub const EV_APP_DATA: u8 = 0x26;
    pub const EV_TX_RESULT: u8 = 0x27;
    pub const EV_TEAM_STATE: u8 = 0x28;
    pub const EV_TACTICAL: u8 = 0x29;
}

pub mod ack_code {
    pub const OK: u8 = 0;
    pub const INVALID_PARAM: u8 = 1;
    pub const UNSUPPORTED: u8 = 2;
    pub const BUSY: u8 = 3;
    pub const NO_MEMORY: u8 = 4;
    pub const TIMEOUT: u8 = 5;
    pub const INTERNAL: u8 = 6;
}

/// Parsed `HelloAck` payload (spec §6):
/// `u16 protocol_version | u16 max_frame_len | u32 capabilities_mask |
///  u8 model_len | model_bytes | u8 fw_len | fw_bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloAckPayload {
    pub protocol_version: u16,
    pub max_frame_len: u16,
    pub capabilities_mask: u32,
    pub model: String,
    pub firmware: String,
}

pub fn parse_hello_ack(payload: &[u8]) -> Option<HelloAckPayload> {
    if payload.len() < 9 {
        return None;
    }
    let protocol_version = u16::from_le_bytes(payload[0..2].try_into().ok()?);
    let max_frame_len = u16::from_le_bytes(payload[2..4].try_into().ok()?);
    let capabilities_mask = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    let model_len = payload[8] as usize;
    let mut pos = 9;
    if payload.len() < pos + model_len + 1 {
        return None;
    }
    let model = String::from_utf8_lossy(&payload[pos..pos + model_len]).into_owned();
    pos += model_len;
    let fw_len = payload[pos] as usize;
    pos += 1;
    if payload.len() < pos + fw_len {
        return None;
    }
    let firmware = String::from_utf8_lossy(&payload[pos..pos + fw_len]).into_owned();
    Some(HelloAckPayload {
        protocol_version,
        max_frame_len,
        capabilities_mask,
        model,
        firmware,
    })
}

/// Parsed `TeamState` payload (spec §6). Fields not surfaced by
/// `crate::types::TeamState` (flags, join target, name, per-member metadata
/// beyond node id) are consumed during parsing but not retained — the core
/// only caches what it needs to stamp outbound team app-data.
pub fn parse_team_state(payload: &[u8]) -> Option<crate::types::TeamState> {
    // version(1) flags(1) reserved(2) self_id(4) team_id(8) join_target(8)
    // team_key_id(4) last_event_seq(4) last_update_s(4) name_len(2) name
    // member_count(1) members(4 * member_count)
    if payload.len() < 1 + 1 + 2 + 4 + 8 + 8 + 4 + 4 + 4 + 2 {
        return None;
    }
    let mut pos = 1 + 1 + 2; // skip version, flags, reserved
    let self_id = u32::from_le_bytes(payload[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let mut team_id = [0u8; 8];
    team_id.copy_from_slice(&payload[pos..pos + 8]);
    pos += 8;
    pos += 8; // join_target_id, unused
    let team_key_id = u32::from_le_bytes(payload[pos..pos + 4].try_into().ok()?);
    pos += 4;
    pos += 4; // last_event_seq, unused
    let last_update_s = u32::from_le_bytes(payload[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let name_len = u16::from_le_bytes(payload[pos..pos + 2].try_into().ok()?) as usize;
    pos += 2;
    if payload.len() < pos + name_len + 1 {
        return None;
    }
    pos += name_len; // team_name, unused
    let member_count = payload[pos] as usize;
    pos += 1;
    if payload.len() < pos + member_count * 4 {
        return None;
    }
    let mut members = Vec::with_capacity(member_count);
    for i in 0..member_count {
        let off = pos + i * 4;
        members.push(u32::from_le_bytes(payload[off..off + 4].try_into().ok()?));
    }
    Some(crate::types::TeamState {
        self_id,
        team_id,
        team_key_id,
        members,
        last_update_s,
    })
}

/// `Hello` payload: `u16 protocol_version | u32 capabilities_mask |
/// u8 client_name_len | client_name_bytes`. Layout not fixed by spec.md
/// (only the device's `HelloAck` reply is specified); mirrors that shape.
pub fn encode_hello(protocol_version: u16, capabilities_mask: u32, client_name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(7 + client_name.len());
    out.extend(protocol_version.to_le_bytes());
    out.extend(capabilities_mask.to_le_bytes());
    out.push(client_name.len() as u8);
    out.extend_from_slice(client_name.as_bytes());
    out
}

/// `CmdSetTime` payload: `u64 epoch_millis`.
pub fn encode_set_time(epoch_millis: u64) -> Vec<u8> {
    epoch_millis.to_le_bytes().to_vec()
}

/// `CmdTxMsg` payload: `u32 to | u8 channel | u32 msg_id | u16 text_len | text`.
pub fn encode_tx_msg(to: u32, channel: u8, msg_id: u32, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + text.len());
    out.extend(to.to_le_bytes());
    out.push(channel);
    out.extend(msg_id.to_le_bytes());
    out.extend((text.len() as u16).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out
}

/// `EvRxMsg` payload: `u32 from | u8 channel | u32 msg_id | u16 text_len | text`.
pub fn parse_rx_msg(payload: &[u8]) -> Option<(u32, u8, u32, String)> {
    if payload.len() < 11 {
        return None;
    }
    let from = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let channel = payload[4];
    let msg_id = u32::from_le_bytes(payload[5..9].try_into().ok()?);
    let text_len = u16::from_le_bytes(payload[9..11].try_into().ok()?) as usize;
    if payload.len() < 11 + text_len {
        return None;
    }
    let text = String::from_utf8_lossy(&payload[11..11 + text_len]).into_owned();
    Some((from, channel, msg_id, text))
}

/// `EvTxResult` payload: `u32 msg_id | u8 success` when long enough to carry a
/// msg-id, else a single `u8 success` byte (devices don't always correlate by
/// msg-id, spec §4.3/glossary "Tx-result").
pub fn parse_tx_result(payload: &[u8]) -> Option<(Option<u32>, bool)> {
    if payload.len() >= 5 {
        let msg_id = u32::from_le_bytes(payload[0..4].try_into().ok()?);
        Some((Some(msg_id), payload[4] != 0))
    } else if payload.len() == 1 {
        Some((None, payload[0] != 0))
    } else {
        None
    }
}

/// Parses an inbound `EvAppData` frame payload using the preferred (non-reserved)
/// `CmdTxAppData` header layout — device-to-host app-data reports aren't
/// subject to the outbound wire-format negotiation in §4.6.
pub fn parse_app_data(payload: &[u8]) -> Option<crate::types::AppDataEvent> {
    // Fixed header: portnum(4) from(4) to(4) channel(1) flags(1) team_id(8)
    // team_key_id(4) msg_id(4) total_len(4) offset(4) chunk_len(2) = 40 bytes.
    if payload.len() < 40 {
        return None;
    }
    let portnum = u32::from_le_bytes(payload[0..4].try_into().ok()?);
    let from = u32::from_le_bytes(payload[4..8].try_into().ok()?);
    let to = u32::from_le_bytes(payload[8..12].try_into().ok()?);
    let channel = payload[12];
    let has_team_metadata = payload[13] != 0;
    let mut team_id = [0u8; 8];
    team_id.copy_from_slice(&payload[14..22]);
    let team_key_id = u32::from_le_bytes(payload[22..26].try_into().ok()?);
    let msg_id = u32::from_le_bytes(payload[26..30].try_into().ok()?);
    let total_len = u32::from_le_bytes(payload[30..34].try_into().ok()?);
    let offset = u32::from_le_bytes(payload[34..38].try_into().ok()?);
    let chunk_len = u16::from_le_bytes(payload[38..40].try_into().ok()?) as usize;
    if payload.len() < 40 + chunk_len {
        return None;
    }
    let chunk = payload[40..40 + chunk_len].to_vec();
    Some(crate::types::AppDataEvent {
        portnum,
        from,
        to,
        channel,
        has_team_metadata,
        team_id,
        team_key_id,
        msg_id,
        total_len,
        offset,
        chunk,
    })
}

/// `CmdTxAppData` header layouts (spec §4.6/§6): the preferred/no-metadata
/// layout, and the alternate layout with 4 reserved bytes before `msg_id`.
pub struct TxAppDataHeader<'a> {
    pub portnum: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u8,
    pub has_team_metadata: bool,
    pub team_id: [u8; 8],
    pub team_key_id: u32,
    pub msg_id: u32,
    pub total_len: u32,
    pub offset: u32,
    pub chunk: &'a [u8],
}

pub fn encode_tx_app_data(header: &TxAppDataHeader<'_>, alternate_layout: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + header.chunk.len());
    out.extend(header.portnum.to_le_bytes());
    out.extend(header.from.to_le_bytes());
    out.extend(header.to.to_le_bytes());
    out.push(header.channel);
    out.push(if header.has_team_metadata { 0x01 } else { 0x00 });
    out.extend(header.team_id);
    out.extend(header.team_key_id.to_le_bytes());
    if alternate_layout {
        out.extend([0u8; 4]); // reserved
    }
    out.extend(header.msg_id.to_le_bytes());
    out.extend(header.total_len.to_le_bytes());
    out.extend(header.offset.to_le_bytes());
    out.extend((header.chunk.len() as u16).to_le_bytes());
    out.extend_from_slice(header.chunk);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_ack_round_trip_fields() {
        let mut payload = Vec::new();
        payload.extend(1u16.to_le_bytes());
        payload.extend(512u16.to_le_bytes());
        payload.extend(0b1111u32.to_le_bytes());
        payload.push(b"TrailMate".len() as u8);
        payload.extend_from_slice(b"TrailMate");
        payload.push(b"dev".len() as u8);
        payload.extend_from_slice(b"dev");

        let got = parse_hello_ack(&payload).unwrap();
        assert_eq!(got.protocol_version, 1);
        assert_eq!(got.max_frame_len, 512);
        assert_eq!(got.capabilities_mask, 0b1111);
        assert_eq!(got.model, "TrailMate");
        assert_eq!(got.firmware, "dev");
    }

    #[test]
    fn encode_tx_app_data_alternate_layout_is_four_bytes_longer() {
        let header = TxAppDataHeader {
            portnum: 1,
            from: 2,
            to: 3,
            channel: 0,
            has_team_metadata: false,
            team_id: [0; 8],
            team_key_id: 0,
            msg_id: 9,
            total_len: 3,
            offset: 0,
            chunk: b"abc",
        };
        let preferred = encode_tx_app_data(&header, false);
        let alternate = encode_tx_app_data(&header, true);
        assert_eq!(alternate.len(), preferred.len() + 4);
    }

    #[test]
    fn parse_app_data_round_trips_preferred_layout() {
        let header = TxAppDataHeader {
            portnum: crate::ports::PORT_TEAM_CHAT,
            from: 10,
            to: 20,
            channel: 2,
            has_team_metadata: true,
            team_id: [9; 8],
            team_key_id: 0xAABBCCDD,
            msg_id: 55,
            total_len: 3,
            offset: 0,
            chunk: b"abc",
        };
        let wire = encode_tx_app_data(&header, false);
        let ev = parse_app_data(&wire).unwrap();
        assert_eq!(ev.portnum, crate::ports::PORT_TEAM_CHAT);
        assert_eq!(ev.from, 10);
        assert_eq!(ev.team_id, [9; 8]);
        assert_eq!(ev.chunk, b"abc");
    }

    #[test]
    fn parse_rx_msg_reads_variable_length_text() {
        let payload = encode_tx_msg(1, 2, 3, "hi");
        // encode_tx_msg's layout (to/channel/msg_id/text) matches parse_rx_msg's
        // (from/channel/msg_id/text) field-for-field, only the first field's
        // meaning differs by direction.
        let (from, channel, msg_id, text) = parse_rx_msg(&payload).unwrap();
        assert_eq!(from, 1);
        assert_eq!(channel, 2);
        assert_eq!(msg_id, 3);
        assert_eq!(text, "hi");
    }

    #[test]
    fn parse_tx_result_prefers_msg_id_correlated_form() {
        let mut payload = Vec::new();
        payload.extend(1234u32.to_le_bytes());
        payload.push(1);
        assert_eq!(parse_tx_result(&payload), Some((Some(1234), true)));
        assert_eq!(parse_tx_result(&[0]), Some((None, false)));
        assert_eq!(parse_tx_result(&[]), None);
    }
}
