//! App-Data Reassembler (spec §4.4): joins fragmented payloads keyed by
//! `(portnum, from, msg_id)` into complete [`AppDataPacket`]s.

use crate::types::{AppDataEvent, AppDataPacket};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct Key {
    portnum: u32,
    from: u32,
    msg_id: u32,
}

struct Partial {
    total_len: u32,
    buffer: Vec<u8>,
    covered: Vec<bool>,
    bytes_covered: u32,
    created_at: Instant,
    header: PartialHeader,
}

#[derive(Clone, Copy)]
struct PartialHeader {
    to: u32,
    channel: u8,
    has_team_metadata: bool,
    team_id: [u8; 8],
    team_key_id: u32,
}

pub struct Reassembler {
    partials: HashMap<Key, Partial>,
    max_age: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Reassembler {
    pub fn new(max_age: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            max_age,
        }
    }

    /// Discards any partial buffer older than `max_age` as of `now`. Call
    /// periodically from the client's event loop; aging out is silent (no
    /// event emitted), per spec §4.4.
    pub fn expire(&mut self, now: Instant) {
        self.partials
            .retain(|_, p| now.duration_since(p.created_at) < self.max_age);
    }

    /// Feeds one fragment, returning a completed packet once every byte of
    /// `[0, total_len)` has arrived.
    pub fn on_event(&mut self, ev: AppDataEvent, now: Instant) -> Option<AppDataPacket> {
        if ev.offset == 0 && ev.chunk.len() as u32 == ev.total_len {
            return Some(AppDataPacket {
                portnum: ev.portnum,
                from: ev.from,
                to: ev.to,
                channel: ev.channel,
                has_team_metadata: ev.has_team_metadata,
                team_id: ev.team_id,
                team_key_id: ev.team_key_id,
                payload: ev.chunk,
            });
        }

        let key = Key {
            portnum: ev.portnum,
            from: ev.from,
            msg_id: ev.msg_id,
        };

        let needs_fresh = match self.partials.get(&key) {
            Some(p) => p.total_len != ev.total_len,
            None => true,
        };
        if needs_fresh {
            self.partials.insert(
                key,
                Partial {
                    total_len: ev.total_len,
                    buffer: vec![0u8; ev.total_len as usize],
                    covered: vec![false; ev.total_len as usize],
                    bytes_covered: 0,
                    created_at: now,
                    header: PartialHeader {
                        to: ev.to,
                        channel: ev.channel,
                        has_team_metadata: ev.has_team_metadata,
                        team_id: ev.team_id,
                        team_key_id: ev.team_key_id,
                    },
                },
            );
        }

        let partial = self.partials.get_mut(&key)?;
        let start = ev.offset as usize;
        let end = start + ev.chunk.len();
        if end > partial.buffer.len() {
            // Would overflow the declared total_len: reject this fragment.
            return None;
        }

        partial.buffer[start..end].copy_from_slice(&ev.chunk);
        for covered in &mut partial.covered[start..end] {
            if !*covered {
                *covered = true;
                partial.bytes_covered += 1;
            }
        }

        if partial.bytes_covered == partial.total_len {
            let partial = self.partials.remove(&key).expect("just looked up");
            Some(AppDataPacket {
                portnum: key.portnum,
                from: key.from,
                to: partial.header.to,
                channel: partial.header.channel,
                has_team_metadata: partial.header.has_team_metadata,
                team_id: partial.header.team_id,
                team_key_id: partial.header.team_key_id,
                payload: partial.buffer,
            })
        } else {
            None
        }
    }
}
