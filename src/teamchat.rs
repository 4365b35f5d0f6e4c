//! Team-Chat Sender (spec §4.6): negotiates the outbound app-data wire
//! format by probing the device, remembering the winning format for the
//! rest of the connection so only the first send pays the probe cost.

use crate::error::{Error, Result};
use crate::types::TeamState;
use crate::wire::{ack_code, TxAppDataHeader};
use std::future::Future;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `HasTeamMetadata` set, team-id/key-id populated.
    Preferred,
    /// Same header layout, `HasTeamMetadata` cleared, team fields zeroed.
    NoMetadata,
    /// 4-byte-longer reserved header, metadata cleared.
    Alternate,
}

pub struct TeamChatContext<'a> {
    pub from: u32,
    pub to: u32,
    pub channel: u8,
    pub msg_id: u32,
    pub text: &'a str,
    pub team_state: Option<&'a TeamState>,
    pub team_conversation_key: Option<&'a str>,
}

#[derive(Default)]
pub struct TeamChatSender {
    /// Format that has already succeeded on this connection, if any.
    remembered: Option<WireFormat>,
}

impl TeamChatSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.remembered = None;
    }

    /// Sends `ctx.text` as team-chat app data, probing wire formats in order
    /// until one is accepted (`InvalidParam` advances to the next format; any
    /// other ack code is returned verbatim). `send_attempt` encodes and sends
    /// a single `CmdTxAppData` frame built from the given header and awaits
    /// its ack error code.
    pub async fn send<F, Fut>(&mut self, ctx: TeamChatContext<'_>, mut send_attempt: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<u8>>,
    {
        let (team_id, team_key_id) = resolve_team_metadata(ctx.team_state, ctx.team_conversation_key)?;

        if let Some(format) = self.remembered {
            let frame = build_frame(&ctx, format, team_id, team_key_id);
            let code = send_attempt(frame).await?;
            return match code {
                ack_code::OK => Ok(()),
                other => Err(Error::protocol(format!("team-chat send rejected, code {other}"))),
            };
        }

        for format in [WireFormat::Preferred, WireFormat::NoMetadata, WireFormat::Alternate] {
            let frame = build_frame(&ctx, format, team_id, team_key_id);
            let code = send_attempt(frame).await?;
            match code {
                ack_code::OK => {
                    self.remembered = Some(format);
                    return Ok(());
                }
                ack_code::INVALID_PARAM => continue,
                other => {
                    return Err(Error::protocol(format!(
                        "team-chat send rejected, code {other}"
                    )))
                }
            }
        }

        Err(Error::protocol("team-chat wire format negotiation exhausted"))
    }
}

fn resolve_team_metadata(
    team_state: Option<&TeamState>,
    conversation_key: Option<&str>,
) -> Result<([u8; 8], u32)> {
    if let Some(state) = team_state {
        return Ok((state.team_id, state.team_key_id));
    }
    if let Some(key) = conversation_key {
        return parse_conversation_key(key);
    }
    Ok(([0u8; 8], 0))
}

/// Parses `"<16-hex-teamid>:<8-hex-keyid>"` (spec §4.6).
fn parse_conversation_key(key: &str) -> Result<([u8; 8], u32)> {
    let (team_hex, key_hex) = key
        .split_once(':')
        .ok_or_else(|| Error::config(format!("malformed team conversation key: {key}")))?;
    if team_hex.len() != 16 || key_hex.len() != 8 {
        return Err(Error::config(format!(
            "malformed team conversation key: {key}"
        )));
    }
    let mut team_id = [0u8; 8];
    for (i, slot) in team_id.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&team_hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::config(format!("malformed team conversation key: {key}")))?;
    }
    let team_key_id = u32::from_str_radix(key_hex, 16)
        .map_err(|_| Error::config(format!("malformed team conversation key: {key}")))?;
    Ok((team_id, team_key_id))
}

fn build_frame(
    ctx: &TeamChatContext<'_>,
    format: WireFormat,
    team_id: [u8; 8],
    team_key_id: u32,
) -> Vec<u8> {
    let (has_team_metadata, team_id, team_key_id, alternate) = match format {
        WireFormat::Preferred => (true, team_id, team_key_id, false),
        WireFormat::NoMetadata => (false, [0u8; 8], 0, false),
        WireFormat::Alternate => (false, [0u8; 8], 0, true),
    };
    let header = TxAppDataHeader {
        portnum: crate::ports::PORT_TEAM_CHAT,
        from: ctx.from,
        to: ctx.to,
        channel: ctx.channel,
        has_team_metadata,
        team_id,
        team_key_id,
        msg_id: ctx.msg_id,
        total_len: ctx.text.len() as u32,
        offset: 0,
        chunk: ctx.text.as_bytes(),
    };
    crate::wire::encode_tx_app_data(&header, alternate)
}
