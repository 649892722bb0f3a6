//! Player session registry and ID pool
//!
//! This module owns the server-side record of every connected player:
//! - Session lifecycle (allocate, rebind on address change, release)
//! - The bounded pool of player IDs, recycled when sessions end
//! - Movement and heartbeat state updated by the session protocol
//! - Materialized snapshots used for broadcasts and diagnostics
//!
//! The registry is plain data. Callers share it behind a single lock so that
//! the dispatch, heartbeat and simulation tasks never observe it half-updated.

use crate::error::{Result, ServerError};
use log::info;
use shared::{MovementState, PlayerId, PlayerInfo};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

/// Liveness of a session as seen by the heartbeat cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Answered the last heartbeat check, or has not been checked yet.
    Connected,
    /// Missed this many consecutive heartbeat cycles.
    TimingOut(u32),
}

/// A connected player
///
/// Each session keeps:
/// - Identity (player ID, unified identifier, display name, character)
/// - The endpoint replies are sent to
/// - The most recent movement report
/// - Heartbeat bookkeeping for timeout detection
#[derive(Debug, Clone)]
pub struct Session {
    /// ID assigned from the pool, unique among live sessions
    pub player_id: PlayerId,
    /// Client-chosen identity that survives address changes
    pub identifier: String,
    pub name: String,
    pub character: String,
    /// Last known endpoint of the client
    pub addr: SocketAddr,
    pub position: (f32, f32),
    pub rotation: f32,
    /// Consecutive heartbeat cycles without an acknowledgement
    pub timeout_attempts: u32,
    /// Set when a timeout ack arrives, consumed by the next heartbeat cycle
    pub heartbeat_acked: bool,
    pub connected_at: Instant,
}

impl Session {
    /// Creates a session at the origin with a clean heartbeat record.
    pub fn new(
        player_id: PlayerId,
        identifier: String,
        name: String,
        character: String,
        addr: SocketAddr,
    ) -> Self {
        Self {
            player_id,
            identifier,
            name,
            character,
            addr,
            position: (0.0, 0.0),
            rotation: 0.0,
            timeout_attempts: 0,
            heartbeat_acked: false,
            connected_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.timeout_attempts {
            0 => SessionState::Connected,
            attempts => SessionState::TimingOut(attempts),
        }
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.player_id,
            name: self.name.clone(),
            character: self.character.clone(),
            identifier: self.identifier.clone(),
        }
    }

    pub fn movement(&self) -> MovementState {
        MovementState::new(self.player_id, self.position.0, self.position.1, self.rotation)
    }
}

/// Owns every live session and the pool of unassigned player IDs
///
/// IDs are handed out from the front of the pool and returned to its back,
/// so a released ID is reused only after every other free ID has been.
pub struct SessionRegistry {
    /// Live sessions indexed by player ID
    sessions: HashMap<PlayerId, Session>,
    /// IDs not currently assigned to any session
    available_ids: VecDeque<PlayerId>,
    capacity: usize,
}

impl SessionRegistry {
    /// Creates an empty registry whose pool holds IDs `1..=capacity`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(PlayerId::MAX as usize);
        Self {
            sessions: HashMap::with_capacity(capacity),
            available_ids: (1..=capacity as PlayerId).collect(),
            capacity,
        }
    }

    pub fn find_by_identifier(&self, identifier: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|session| session.identifier == identifier)
    }

    pub fn find_by_id(&self, player_id: PlayerId) -> Option<&Session> {
        self.sessions.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: PlayerId) -> Option<&mut Session> {
        self.sessions.get_mut(&player_id)
    }

    /// Creates a session for a new identity
    ///
    /// Takes the next free ID from the pool. Fails with `PoolExhausted`
    /// without touching any state when every ID is in use.
    pub fn allocate(
        &mut self,
        identifier: &str,
        name: &str,
        character: &str,
        addr: SocketAddr,
    ) -> Result<&Session> {
        let player_id = self
            .available_ids
            .pop_front()
            .ok_or(ServerError::PoolExhausted {
                capacity: self.capacity,
            })?;

        let session = Session::new(
            player_id,
            identifier.to_string(),
            name.to_string(),
            character.to_string(),
            addr,
        );
        info!(
            "Player {} ({}) connected from {} as {}",
            player_id, identifier, addr, name
        );

        Ok(&*self.sessions.entry(player_id).or_insert(session))
    }

    /// Points an existing session at a new endpoint. Returns false if the
    /// player is not connected.
    pub fn rebind(&mut self, player_id: PlayerId, addr: SocketAddr) -> bool {
        match self.sessions.get_mut(&player_id) {
            Some(session) => {
                if session.addr != addr {
                    info!(
                        "Player {} moved from {} to {}",
                        player_id, session.addr, addr
                    );
                    session.addr = addr;
                }
                true
            }
            None => false,
        }
    }

    /// Removes a session and returns its ID to the pool.
    pub fn release(&mut self, player_id: PlayerId) -> Option<Session> {
        let session = self.sessions.remove(&player_id)?;
        self.available_ids.push_back(player_id);
        info!("Player {} ({}) released", player_id, session.identifier);
        Some(session)
    }

    /// Records a movement report. Returns false for unknown players.
    pub fn update_movement(&mut self, movement: &MovementState) -> bool {
        match self.sessions.get_mut(&movement.player_id) {
            Some(session) => {
                session.position = (movement.x, movement.y);
                session.rotation = movement.rotation;
                true
            }
            None => false,
        }
    }

    /// Marks the current heartbeat cycle as answered for a player.
    pub fn acknowledge_heartbeat(&mut self, player_id: PlayerId) -> bool {
        match self.sessions.get_mut(&player_id) {
            Some(session) => {
                session.heartbeat_acked = true;
                true
            }
            None => false,
        }
    }

    /// Copies every session, ordered by player ID.
    pub fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.player_id);
        sessions
    }

    /// IDs of all live sessions, ascending.
    pub fn player_ids(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn address_of(&self, player_id: PlayerId) -> Option<SocketAddr> {
        self.sessions.get(&player_id).map(|session| session.addr)
    }

    /// Gets all player IDs and their endpoints for broadcasting.
    pub fn addresses(&self) -> Vec<(PlayerId, SocketAddr)> {
        self.sessions
            .iter()
            .map(|(id, session)| (*id, session.addr))
            .collect()
    }

    /// Public player records, ordered by player ID.
    pub fn roster(&self) -> Vec<PlayerInfo> {
        self.all().iter().map(Session::info).collect()
    }

    /// Latest movement of every player, ordered by player ID.
    pub fn movement_states(&self) -> Vec<MovementState> {
        let mut states: Vec<MovementState> =
            self.sessions.values().map(Session::movement).collect();
        states.sort_by_key(|state| state.player_id);
        states
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of IDs still free in the pool.
    pub fn available(&self) -> usize {
        self.available_ids.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
