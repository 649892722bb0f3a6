//! Binary encoding of [`Packet`]s.
//!
//! Wire format (big-endian):
//! ```text
//! ┌──────────┬─────────────────────────────────────────────┐
//! │ tag (u8) │ payload, layout fixed by the tag            │
//! └──────────┴─────────────────────────────────────────────┘
//!
//! Connect             identifier: str, name: str, character: str
//! ConnectAccept       player_id: u16, name: str, character: str, identifier: str
//! Disconnect          player_id: u16
//! TimeoutCheck        player_id: u16
//! TimeoutAck          player_id: u16
//! ReconnectRequest    -
//! Movement            player_id: u16, x: f32, y: f32, rotation: f32
//! WorldStateUpdate    count: u16, count x Movement payload
//! PlayerListRequest   -
//! PlayerListResponse  count: u16, count x ConnectAccept payload
//!
//! str = u16 byte length followed by UTF-8 bytes
//! ```
//!
//! Decoding is strict: a buffer must contain exactly the bytes the tag's
//! layout describes, no more and no less.

use crate::{MovementState, Packet, PacketKind, PlayerInfo, MAX_PACKET_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

const MOVEMENT_SIZE: usize = 2 + 4 * 3;
/// Smallest possible player info record: an ID and three empty strings.
const MIN_PLAYER_INFO_SIZE: usize = 2 + 2 * 3;
/// Tag plus record count of a list packet.
const LIST_HEADER_SIZE: usize = 1 + 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("empty datagram")]
    Empty,

    #[error("unknown packet tag {0:#04x}")]
    UnknownTag(u8),

    #[error("truncated {kind:?} packet: need {need} more bytes, have {have}")]
    Truncated {
        kind: PacketKind,
        need: usize,
        have: usize,
    },

    #[error("{kind:?} packet has {extra} trailing bytes")]
    TrailingBytes { kind: PacketKind, extra: usize },

    #[error("{kind:?} packet contains a string that is not valid UTF-8")]
    InvalidUtf8 { kind: PacketKind },
}

/// Serializes a packet. Never fails; strings and lists longer than a `u16`
/// length prefix can express are cut short.
pub fn encode(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(packet.kind().tag());

    match packet {
        Packet::Connect {
            identifier,
            name,
            character,
        } => {
            put_str(&mut buf, identifier);
            put_str(&mut buf, name);
            put_str(&mut buf, character);
        }
        Packet::ConnectAccept(info) => put_player_info(&mut buf, info),
        Packet::Disconnect { player_id }
        | Packet::TimeoutCheck { player_id }
        | Packet::TimeoutAck { player_id } => buf.put_u16(*player_id),
        Packet::ReconnectRequest | Packet::PlayerListRequest => {}
        Packet::Movement(movement) => put_movement(&mut buf, movement),
        Packet::WorldStateUpdate { players } => {
            let count = players.len().min(u16::MAX as usize);
            buf.put_u16(count as u16);
            for movement in &players[..count] {
                put_movement(&mut buf, movement);
            }
        }
        Packet::PlayerListResponse { players } => {
            let count = players.len().min(u16::MAX as usize);
            buf.put_u16(count as u16);
            for info in &players[..count] {
                put_player_info(&mut buf, info);
            }
        }
    }

    buf.freeze()
}

/// Splits a player list into as few `PlayerListResponse` packets as
/// possible, each encoding to at most [`MAX_PACKET_SIZE`] bytes.
///
/// A single record too large for any datagram still gets a packet of its
/// own. Returns nothing for an empty list.
pub fn split_player_list(players: Vec<PlayerInfo>) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut chunk = Vec::new();
    let mut size = LIST_HEADER_SIZE;

    for info in players {
        let record = player_info_size(&info);
        if !chunk.is_empty() && size + record > MAX_PACKET_SIZE {
            packets.push(Packet::PlayerListResponse {
                players: std::mem::take(&mut chunk),
            });
            size = LIST_HEADER_SIZE;
        }
        size += record;
        chunk.push(info);
    }

    if !chunk.is_empty() {
        packets.push(Packet::PlayerListResponse { players: chunk });
    }
    packets
}

/// Splits movement states into `WorldStateUpdate` packets that each fit
/// in [`MAX_PACKET_SIZE`] bytes.
pub fn split_world_state(players: Vec<MovementState>) -> Vec<Packet> {
    let per_packet = (MAX_PACKET_SIZE - LIST_HEADER_SIZE) / MOVEMENT_SIZE;
    players
        .chunks(per_packet)
        .map(|chunk| Packet::WorldStateUpdate {
            players: chunk.to_vec(),
        })
        .collect()
}

fn player_info_size(info: &PlayerInfo) -> usize {
    let str_size = |value: &str| 2 + value.len().min(u16::MAX as usize);
    2 + str_size(&info.name) + str_size(&info.character) + str_size(&info.identifier)
}

/// Parses a datagram into a packet.
pub fn decode(data: &[u8]) -> Result<Packet, MalformedPacket> {
    let (&tag, payload) = data.split_first().ok_or(MalformedPacket::Empty)?;
    let kind = PacketKind::from_tag(tag).ok_or(MalformedPacket::UnknownTag(tag))?;
    let mut reader = Reader { buf: payload, kind };

    let packet = match kind {
        PacketKind::Connect => Packet::Connect {
            identifier: reader.string()?,
            name: reader.string()?,
            character: reader.string()?,
        },
        PacketKind::ConnectAccept => Packet::ConnectAccept(reader.player_info()?),
        PacketKind::Disconnect => Packet::Disconnect {
            player_id: reader.u16()?,
        },
        PacketKind::TimeoutCheck => Packet::TimeoutCheck {
            player_id: reader.u16()?,
        },
        PacketKind::TimeoutAck => Packet::TimeoutAck {
            player_id: reader.u16()?,
        },
        PacketKind::ReconnectRequest => Packet::ReconnectRequest,
        PacketKind::Movement => Packet::Movement(reader.movement()?),
        PacketKind::WorldStateUpdate => {
            let count = reader.u16()? as usize;
            // Never trust the count for preallocation
            let mut players = Vec::with_capacity(count.min(reader.buf.len() / MOVEMENT_SIZE));
            for _ in 0..count {
                players.push(reader.movement()?);
            }
            Packet::WorldStateUpdate { players }
        }
        PacketKind::PlayerListRequest => Packet::PlayerListRequest,
        PacketKind::PlayerListResponse => {
            let count = reader.u16()? as usize;
            let mut players =
                Vec::with_capacity(count.min(reader.buf.len() / MIN_PLAYER_INFO_SIZE));
            for _ in 0..count {
                players.push(reader.player_info()?);
            }
            Packet::PlayerListResponse { players }
        }
    };

    reader.finish()?;
    Ok(packet)
}

fn put_str(buf: &mut BytesMut, value: &str) {
    let mut end = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16(end as u16);
    buf.put_slice(&value.as_bytes()[..end]);
}

fn put_movement(buf: &mut BytesMut, movement: &MovementState) {
    buf.put_u16(movement.player_id);
    buf.put_f32(movement.x);
    buf.put_f32(movement.y);
    buf.put_f32(movement.rotation);
}

fn put_player_info(buf: &mut BytesMut, info: &PlayerInfo) {
    buf.put_u16(info.player_id);
    put_str(buf, &info.name);
    put_str(buf, &info.character);
    put_str(buf, &info.identifier);
}

/// Bounds-checked cursor over a packet payload.
struct Reader<'a> {
    buf: &'a [u8],
    kind: PacketKind,
}

impl<'a> Reader<'a> {
    fn need(&self, need: usize) -> Result<(), MalformedPacket> {
        if self.buf.remaining() < need {
            return Err(MalformedPacket::Truncated {
                kind: self.kind,
                need,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, MalformedPacket> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn f32(&mut self) -> Result<f32, MalformedPacket> {
        self.need(4)?;
        Ok(self.buf.get_f32())
    }

    fn string(&mut self) -> Result<String, MalformedPacket> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| MalformedPacket::InvalidUtf8 { kind: self.kind })
    }

    fn movement(&mut self) -> Result<MovementState, MalformedPacket> {
        self.need(MOVEMENT_SIZE)?;
        Ok(MovementState {
            player_id: self.u16()?,
            x: self.f32()?,
            y: self.f32()?,
            rotation: self.f32()?,
        })
    }

    fn player_info(&mut self) -> Result<PlayerInfo, MalformedPacket> {
        Ok(PlayerInfo {
            player_id: self.u16()?,
            name: self.string()?,
            character: self.string()?,
            identifier: self.string()?,
        })
    }

    fn finish(self) -> Result<(), MalformedPacket> {
        match self.buf.remaining() {
            0 => Ok(()),
            extra => Err(MalformedPacket::TrailingBytes {
                kind: self.kind,
                extra,
            }),
        }
    }
}
