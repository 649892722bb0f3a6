//! Packet types shared by the session server and its clients.
//!
//! Every datagram starts with a one-byte tag identifying a [`PacketKind`],
//! followed by a payload with fixed field widths. See [`codec`] for the
//! exact byte layout.

pub mod codec;

pub use codec::{decode, encode, split_player_list, split_world_state, MalformedPacket};

/// Largest datagram the server will read in one receive call.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Byte limits on the strings a client may send in a connect request.
pub const MAX_IDENTIFIER_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 32;
pub const MAX_CHARACTER_LEN: usize = 32;

/// Numeric player identifier handed out by the server's ID pool.
pub type PlayerId = u16;

/// Public description of a connected player.
///
/// Sent on its own as the connection accept reply and as the per-player
/// record of a player list response.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub player_id: PlayerId,
    pub name: String,
    pub character: String,
    pub identifier: String,
}

/// Last reported movement of a player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementState {
    pub player_id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}

impl MovementState {
    pub fn new(player_id: PlayerId, x: f32, y: f32, rotation: f32) -> Self {
        Self {
            player_id,
            x,
            y,
            rotation,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    // Client -> server
    Connect {
        identifier: String,
        name: String,
        character: String,
    },
    Disconnect {
        player_id: PlayerId,
    },
    TimeoutAck {
        player_id: PlayerId,
    },
    Movement(MovementState),
    PlayerListRequest,

    // Server -> client
    ConnectAccept(PlayerInfo),
    TimeoutCheck {
        player_id: PlayerId,
    },
    ReconnectRequest,
    WorldStateUpdate {
        players: Vec<MovementState>,
    },
    PlayerListResponse {
        players: Vec<PlayerInfo>,
    },
}

/// Wire tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0x01,
    ConnectAccept = 0x02,
    Disconnect = 0x03,
    TimeoutCheck = 0x04,
    TimeoutAck = 0x05,
    ReconnectRequest = 0x06,
    Movement = 0x07,
    WorldStateUpdate = 0x08,
    PlayerListRequest = 0x09,
    PlayerListResponse = 0x0A,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            0x01 => Self::Connect,
            0x02 => Self::ConnectAccept,
            0x03 => Self::Disconnect,
            0x04 => Self::TimeoutCheck,
            0x05 => Self::TimeoutAck,
            0x06 => Self::ReconnectRequest,
            0x07 => Self::Movement,
            0x08 => Self::WorldStateUpdate,
            0x09 => Self::PlayerListRequest,
            0x0A => Self::PlayerListResponse,
            _ => return None,
        };
        Some(kind)
    }
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Connect { .. } => PacketKind::Connect,
            Packet::Disconnect { .. } => PacketKind::Disconnect,
            Packet::TimeoutAck { .. } => PacketKind::TimeoutAck,
            Packet::Movement(_) => PacketKind::Movement,
            Packet::PlayerListRequest => PacketKind::PlayerListRequest,
            Packet::ConnectAccept(_) => PacketKind::ConnectAccept,
            Packet::TimeoutCheck { .. } => PacketKind::TimeoutCheck,
            Packet::ReconnectRequest => PacketKind::ReconnectRequest,
            Packet::WorldStateUpdate { .. } => PacketKind::WorldStateUpdate,
            Packet::PlayerListResponse { .. } => PacketKind::PlayerListResponse,
        }
    }
}
