//! Session protocol state machine
//!
//! Applies decoded client packets and periodic heartbeat cycles to the
//! session registry and queues the resulting replies. Per session the states
//! are:
//!
//! ```text
//! Connecting --Connect--> Connected --missed cycle--> TimingOut(1..=max)
//!                             ^                             |
//!                             +--------TimeoutAck-----------+
//!                                                           |
//! Disconnected <--Disconnect / missed cycle over max--------+
//! ```
//!
//! Packets referring to a player that is no longer connected are expected
//! under unordered delivery and are treated as no-ops.

use crate::session::SessionRegistry;
use crate::transport::{Outbound, OutboundSender};
use log::{debug, info, warn};
use shared::{
    split_player_list, MovementState, Packet, PlayerId, MAX_CHARACTER_LEN, MAX_IDENTIFIER_LEN,
    MAX_NAME_LEN,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What one heartbeat cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Players that acknowledged since the previous cycle
    pub answered: Vec<PlayerId>,
    /// Players sent a fresh timeout check
    pub checked: Vec<PlayerId>,
    /// Players released for exceeding the attempt limit
    pub evicted: Vec<PlayerId>,
}

pub struct SessionProtocol {
    sessions: Arc<RwLock<SessionRegistry>>,
    outbound: OutboundSender,
    max_timeout_attempts: u32,
}

impl SessionProtocol {
    pub fn new(
        sessions: Arc<RwLock<SessionRegistry>>,
        outbound: OutboundSender,
        max_timeout_attempts: u32,
    ) -> Self {
        Self {
            sessions,
            outbound,
            max_timeout_attempts,
        }
    }

    /// Handles one decoded packet from `addr`.
    pub async fn on_packet(&self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                identifier,
                name,
                character,
            } => {
                self.handle_connect(&identifier, &name, &character, addr)
                    .await;
            }

            Packet::Disconnect { player_id } => {
                let released = self.sessions.write().await.release(player_id);
                if released.is_none() {
                    debug!("Disconnect for unknown player {} from {}", player_id, addr);
                }
            }

            Packet::Movement(movement) => self.handle_movement(movement, addr).await,

            Packet::TimeoutAck { player_id } => {
                let known = self.sessions.write().await.acknowledge_heartbeat(player_id);
                if !known {
                    debug!("Timeout ack for unknown player {} from {}", player_id, addr);
                }
            }

            Packet::PlayerListRequest => {
                let players = self.sessions.read().await.roster();
                for packet in split_player_list(players) {
                    self.queue(Outbound::BroadcastPacket { packet });
                }
            }

            other => {
                warn!("Unexpected {:?} packet from {}", other.kind(), addr);
            }
        }
    }

    async fn handle_connect(
        &self,
        identifier: &str,
        name: &str,
        character: &str,
        addr: SocketAddr,
    ) {
        if identifier.len() > MAX_IDENTIFIER_LEN
            || name.len() > MAX_NAME_LEN
            || character.len() > MAX_CHARACTER_LEN
        {
            warn!(
                "Rejecting connect from {}: identifier, name or character too long",
                addr
            );
            return;
        }

        let accept = {
            let mut sessions = self.sessions.write().await;
            let existing = sessions
                .find_by_identifier(identifier)
                .map(|session| session.player_id);

            match existing {
                Some(player_id) => {
                    // Same identity, possibly from a new endpoint: keep the ID
                    sessions.rebind(player_id, addr);
                    info!("Player {} ({}) reconnected from {}", player_id, identifier, addr);
                    sessions.find_by_id(player_id).map(|session| session.info())
                }
                None => match sessions.allocate(identifier, name, character, addr) {
                    Ok(session) => Some(session.info()),
                    Err(e) => {
                        warn!("Rejecting {} from {}: {}", identifier, addr, e);
                        None
                    }
                },
            }
        };

        if let Some(info) = accept {
            self.queue(Outbound::SendPacket {
                packet: Packet::ConnectAccept(info),
                addr,
            });
        }
    }

    async fn handle_movement(&self, movement: MovementState, addr: SocketAddr) {
        let known = self.sessions.write().await.update_movement(&movement);
        if !known {
            info!(
                "Movement from unknown player {} at {}, requesting reconnect",
                movement.player_id, addr
            );
            self.queue(Outbound::SendPacket {
                packet: Packet::ReconnectRequest,
                addr,
            });
        }
    }

    /// Runs one heartbeat cycle over every session
    ///
    /// A session that acknowledged since the last cycle has its attempt count
    /// reset. Any other session gets one more attempt counted against it and
    /// is either checked again or, past the limit, released.
    pub async fn heartbeat_cycle(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        {
            let mut sessions = self.sessions.write().await;
            for player_id in sessions.player_ids() {
                let Some(session) = sessions.get_mut(player_id) else {
                    continue;
                };

                if session.heartbeat_acked {
                    session.heartbeat_acked = false;
                    session.timeout_attempts = 0;
                    report.answered.push(player_id);
                    continue;
                }

                session.timeout_attempts += 1;
                if session.timeout_attempts > self.max_timeout_attempts {
                    let attempts = session.timeout_attempts - 1;
                    sessions.release(player_id);
                    info!(
                        "Player {} timed out after {} unanswered checks",
                        player_id, attempts
                    );
                    report.evicted.push(player_id);
                } else {
                    report.checked.push(player_id);
                }
            }
        }

        for &player_id in &report.checked {
            self.queue(Outbound::SendToPlayer {
                packet: Packet::TimeoutCheck { player_id },
                player_id,
            });
        }

        if !report.evicted.is_empty() || !report.checked.is_empty() {
            debug!(
                "Heartbeat: {} answered, {} checked, {} evicted",
                report.answered.len(),
                report.checked.len(),
                report.evicted.len()
            );
        }

        report
    }

    /// Removes a player on the host's request and tells the client.
    pub async fn request_disconnect(&self, player_id: PlayerId) -> bool {
        let released = self.sessions.write().await.release(player_id);
        match released {
            Some(session) => {
                self.queue(Outbound::SendPacket {
                    packet: Packet::Disconnect { player_id },
                    addr: session.addr,
                });
                true
            }
            None => false,
        }
    }

    fn queue(&self, message: Outbound) {
        // Only fails once the send loop is gone, i.e. during shutdown
        if let Err(e) = self.outbound.send(message) {
            debug!("Dropping outbound packet, send loop stopped: {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use shared::{decode, encode, PlayerInfo, MAX_PACKET_SIZE};
    use tokio::sync::mpsc;

    const MAX_ATTEMPTS: u32 = 3;

    struct Fixture {
        protocol: SessionProtocol,
        sessions: Arc<RwLock<SessionRegistry>>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    }

    fn fixture(capacity: usize) -> Fixture {
        let sessions = Arc::new(RwLock::new(SessionRegistry::new(capacity)));
        let (tx, outbound) = mpsc::unbounded_channel();
        Fixture {
            protocol: SessionProtocol::new(Arc::clone(&sessions), tx, MAX_ATTEMPTS),
            sessions,
            outbound,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn connect_packet(identifier: &str) -> Packet {
        Packet::Connect {
            identifier: identifier.to_string(),
            name: format!("{} name", identifier),
            character: "robot".to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn expect_accept(message: Outbound, to: SocketAddr) -> PlayerInfo {
        match message {
            Outbound::SendPacket {
                packet: Packet::ConnectAccept(info),
                addr,
            } => {
                assert_eq!(addr, to);
                info
            }
            other => panic!("Expected connect accept, got {:?}", other),
        }
    }

    async fn connect(f: &mut Fixture, identifier: &str, port: u16) -> PlayerId {
        f.protocol.on_packet(connect_packet(identifier), addr(port)).await;
        let mut messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        expect_accept(messages.remove(0), addr(port)).player_id
    }

    #[tokio::test]
    async fn test_connect_creates_session_and_accepts() {
        let mut f = fixture(4);
        f.protocol.on_packet(connect_packet("device-1"), addr(5000)).await;

        let messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        let info = expect_accept(messages.into_iter().next().unwrap(), addr(5000));
        assert_eq!(info.player_id, 1);
        assert_eq!(info.name, "device-1 name");
        assert_eq!(info.character, "robot");
        assert_eq!(info.identifier, "device-1");

        assert_eq!(f.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_from_new_address_rebinds() {
        let mut f = fixture(4);
        let first = connect(&mut f, "device-1", 5000).await;
        let second = connect(&mut f, "device-1", 6000).await;

        assert_eq!(first, second);
        let sessions = f.sessions.read().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.address_of(first), Some(addr(6000)));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_rejects_without_reply() {
        let mut f = fixture(2);
        connect(&mut f, "a", 5000).await;
        connect(&mut f, "b", 5001).await;

        f.protocol.on_packet(connect_packet("c"), addr(5002)).await;

        assert!(drain(&mut f.outbound).is_empty());
        let mut sessions = f.sessions.write().await;
        assert_eq!(sessions.len(), 2);
        assert!(sessions.find_by_identifier("c").is_none());
        assert!(matches!(
            sessions.allocate("c", "", "", addr(5002)),
            Err(ServerError::PoolExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_releases_immediately() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        f.protocol
            .on_packet(Packet::Disconnect { player_id: id }, addr(5000))
            .await;
        assert!(f.sessions.read().await.is_empty());
        assert_eq!(f.sessions.read().await.available(), 2);

        // A late duplicate is harmless
        f.protocol
            .on_packet(Packet::Disconnect { player_id: id }, addr(5000))
            .await;
        assert!(drain(&mut f.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_movement_updates_known_session() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;
        f.sessions.write().await.get_mut(id).unwrap().timeout_attempts = 2;

        f.protocol
            .on_packet(
                Packet::Movement(MovementState::new(id, 10.0, -4.0, 1.25)),
                addr(5000),
            )
            .await;

        assert!(drain(&mut f.outbound).is_empty());
        let sessions = f.sessions.read().await;
        let session = sessions.find_by_id(id).unwrap();
        assert_eq!(session.position, (10.0, -4.0));
        assert_eq!(session.rotation, 1.25);
        // Movement says nothing about heartbeat liveness
        assert_eq!(session.timeout_attempts, 2);
    }

    #[tokio::test]
    async fn test_movement_from_unknown_player_requests_reconnect() {
        let mut f = fixture(2);

        f.protocol
            .on_packet(
                Packet::Movement(MovementState::new(17, 1.0, 1.0, 0.0)),
                addr(7000),
            )
            .await;

        let messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Outbound::SendPacket {
                packet: Packet::ReconnectRequest,
                addr: to,
            } => assert_eq!(*to, addr(7000)),
            other => panic!("Expected reconnect request, got {:?}", other),
        }
        assert!(f.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_player_list_request_broadcasts_roster() {
        let mut f = fixture(4);
        connect(&mut f, "a", 5000).await;
        connect(&mut f, "b", 5001).await;

        f.protocol
            .on_packet(Packet::PlayerListRequest, addr(5000))
            .await;

        let messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Outbound::BroadcastPacket {
                packet: Packet::PlayerListResponse { players },
            } => {
                let identifiers: Vec<&str> =
                    players.iter().map(|p| p.identifier.as_str()).collect();
                assert_eq!(identifiers, vec!["a", "b"]);
            }
            other => panic!("Expected player list broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_bound_packets_are_ignored() {
        let mut f = fixture(2);
        f.protocol
            .on_packet(Packet::TimeoutCheck { player_id: 1 }, addr(5000))
            .await;
        f.protocol
            .on_packet(Packet::WorldStateUpdate { players: vec![] }, addr(5000))
            .await;

        assert!(drain(&mut f.outbound).is_empty());
        assert!(f.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_checks_unanswered_sessions() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        let report = f.protocol.heartbeat_cycle().await;
        assert_eq!(report.checked, vec![id]);
        assert!(report.evicted.is_empty());

        let messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Outbound::SendToPlayer { packet, player_id } => {
                assert_eq!(*player_id, id);
                assert_eq!(*packet, Packet::TimeoutCheck { player_id: id });
            }
            other => panic!("Expected timeout check, got {:?}", other),
        }

        let sessions = f.sessions.read().await;
        assert_eq!(sessions.find_by_id(id).unwrap().timeout_attempts, 1);
    }

    #[tokio::test]
    async fn test_silent_session_is_evicted_after_max_attempts() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        for cycle in 1..=MAX_ATTEMPTS {
            let report = f.protocol.heartbeat_cycle().await;
            assert_eq!(report.checked, vec![id], "cycle {}", cycle);
        }

        let report = f.protocol.heartbeat_cycle().await;
        assert_eq!(report.evicted, vec![id]);
        assert!(report.checked.is_empty());

        let sessions = f.sessions.read().await;
        assert!(sessions.find_by_id(id).is_none());
        assert_eq!(sessions.available(), 2);
    }

    #[tokio::test]
    async fn test_answering_session_is_never_evicted() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        for _ in 0..(MAX_ATTEMPTS * 5) {
            f.protocol.heartbeat_cycle().await;
            f.protocol
                .on_packet(Packet::TimeoutAck { player_id: id }, addr(5000))
                .await;
        }

        let report = f.protocol.heartbeat_cycle().await;
        assert_eq!(report.answered, vec![id]);
        let sessions = f.sessions.read().await;
        let session = sessions.find_by_id(id).unwrap();
        assert_eq!(session.timeout_attempts, 0);
        assert!(!session.heartbeat_acked);
    }

    #[tokio::test]
    async fn test_ack_resets_attempts_mid_timeout() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        for _ in 0..MAX_ATTEMPTS {
            f.protocol.heartbeat_cycle().await;
        }
        f.protocol
            .on_packet(Packet::TimeoutAck { player_id: id }, addr(5000))
            .await;

        let report = f.protocol.heartbeat_cycle().await;
        assert_eq!(report.answered, vec![id]);
        assert!(report.evicted.is_empty());

        // The count starts over
        for _ in 0..MAX_ATTEMPTS {
            assert!(f.protocol.heartbeat_cycle().await.evicted.is_empty());
        }
        assert_eq!(f.protocol.heartbeat_cycle().await.evicted, vec![id]);
    }

    #[tokio::test]
    async fn test_late_packets_for_evicted_player_are_noops() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;
        for _ in 0..=MAX_ATTEMPTS {
            f.protocol.heartbeat_cycle().await;
        }
        drain(&mut f.outbound);
        assert!(f.sessions.read().await.is_empty());

        f.protocol
            .on_packet(Packet::TimeoutAck { player_id: id }, addr(5000))
            .await;
        f.protocol
            .on_packet(Packet::Disconnect { player_id: id }, addr(5000))
            .await;

        assert!(drain(&mut f.outbound).is_empty());
        assert!(f.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_request_disconnect_notifies_client() {
        let mut f = fixture(2);
        let id = connect(&mut f, "a", 5000).await;

        assert!(f.protocol.request_disconnect(id).await);
        assert!(f.sessions.read().await.is_empty());

        let messages = drain(&mut f.outbound);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            Outbound::SendPacket { packet, addr: to } => {
                assert_eq!(*packet, Packet::Disconnect { player_id: id });
                assert_eq!(*to, addr(5000));
            }
            other => panic!("Expected disconnect, got {:?}", other),
        }

        assert!(!f.protocol.request_disconnect(id).await);
    }

    #[tokio::test]
    async fn test_queue_after_send_loop_stopped_is_silent() {
        let f = fixture(2);
        drop(f.outbound);

        f.protocol
            .on_packet(
                Packet::Movement(MovementState::new(3, 0.0, 0.0, 0.0)),
                addr(5000),
            )
            .await;
    }

    async fn roster_datagrams(f: &mut Fixture) -> Vec<Vec<PlayerInfo>> {
        f.protocol
            .on_packet(Packet::PlayerListRequest, addr(5000))
            .await;

        drain(&mut f.outbound)
            .into_iter()
            .map(|message| match message {
                Outbound::BroadcastPacket { packet } => {
                    let bytes = encode(&packet);
                    assert!(bytes.len() <= MAX_PACKET_SIZE, "{} bytes", bytes.len());
                    match decode(&bytes) {
                        Ok(Packet::PlayerListResponse { players }) => players,
                        other => panic!("Expected player list, got {:?}", other),
                    }
                }
                other => panic!("Expected broadcast, got {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_overlong_connect_is_rejected() {
        let mut f = fixture(4);
        let too_long = [
            ("x".repeat(MAX_IDENTIFIER_LEN + 1), "name".to_string(), "c".to_string()),
            ("id".to_string(), "n".repeat(MAX_NAME_LEN + 1), "c".to_string()),
            ("id".to_string(), "name".to_string(), "c".repeat(MAX_CHARACTER_LEN + 1)),
        ];

        for (identifier, name, character) in too_long {
            let packet = Packet::Connect {
                identifier,
                name,
                character,
            };
            f.protocol.on_packet(packet, addr(5000)).await;
        }

        assert!(drain(&mut f.outbound).is_empty());
        assert!(f.sessions.read().await.is_empty());

        // Exactly at the limits is fine
        let packet = Packet::Connect {
            identifier: "x".repeat(MAX_IDENTIFIER_LEN),
            name: "n".repeat(MAX_NAME_LEN),
            character: "c".repeat(MAX_CHARACTER_LEN),
        };
        f.protocol.on_packet(packet, addr(5000)).await;
        assert_eq!(drain(&mut f.outbound).len(), 1);
        assert_eq!(f.sessions.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_full_roster_of_uuid_clients_is_decodable() {
        let mut f = fixture(31);
        for i in 0..31u16 {
            let packet = Packet::Connect {
                identifier: format!("{:08x}-0000-4000-8000-{:012x}", i, i),
                name: format!("Player name {:04}", i),
                character: "knight".to_string(),
            };
            f.protocol.on_packet(packet, addr(6000 + i)).await;
        }
        assert_eq!(drain(&mut f.outbound).len(), 31);

        // One list would be 2049 bytes
        let datagrams = roster_datagrams(&mut f).await;
        assert_eq!(datagrams.len(), 2);

        let ids: Vec<PlayerId> = datagrams.concat().iter().map(|p| p.player_id).collect();
        assert_eq!(ids, (1..=31).collect::<Vec<PlayerId>>());
    }

    #[tokio::test]
    async fn test_full_roster_at_field_limits_fits_datagrams() {
        let mut f = fixture(31);
        for i in 0..31u16 {
            let packet = Packet::Connect {
                identifier: format!("{:0>width$}", i, width = MAX_IDENTIFIER_LEN),
                name: "n".repeat(MAX_NAME_LEN),
                character: "c".repeat(MAX_CHARACTER_LEN),
            };
            f.protocol.on_packet(packet, addr(6000 + i)).await;
        }
        assert_eq!(f.sessions.read().await.len(), 31);
        drain(&mut f.outbound);

        let datagrams = roster_datagrams(&mut f).await;
        assert_eq!(datagrams.iter().map(Vec::len).sum::<usize>(), 31);
    }
}
