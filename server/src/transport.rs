//! UDP receive and send units.
//!
//! The receive loop only copies datagrams off the socket and queues them for
//! the dispatch task, so decoding and protocol work never delay intake. All
//! writes go through a single send loop fed by an [`Outbound`] queue, which
//! serializes access to the socket for every producer.

use crate::session::SessionRegistry;
use crate::stats::BandwidthSampler;
use bytes::Bytes;
use log::{debug, error};
use shared::{encode, Packet, PlayerId, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};

/// A datagram as it came off the socket.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub addr: SocketAddr,
}

/// Packets queued for the send loop.
#[derive(Debug)]
pub enum Outbound {
    /// Send to a fixed endpoint.
    SendPacket { packet: Packet, addr: SocketAddr },
    /// Send to a player's current endpoint. Dropped if the player is gone
    /// by the time the packet is sent.
    SendToPlayer { packet: Packet, player_id: PlayerId },
    /// Send to every connected player.
    BroadcastPacket { packet: Packet },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Reads datagrams until shutdown and pushes them onto the hand-off queue.
pub async fn receive_loop(
    socket: Arc<UdpSocket>,
    inbound: mpsc::UnboundedSender<Datagram>,
    sampler: Arc<BandwidthSampler>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = [0u8; MAX_PACKET_SIZE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buffer) => match result {
                Ok((len, addr)) => {
                    sampler.record_received(len);
                    let datagram = Datagram {
                        data: Bytes::copy_from_slice(&buffer[..len]),
                        addr,
                    };
                    if inbound.send(datagram).is_err() {
                        debug!("Dispatch queue closed, stopping receiver");
                        break;
                    }
                }
                Err(e) => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    // ICMP errors from earlier sends surface here, keep going
                    error!("Error receiving datagram: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!("Receive loop stopped");
}

/// Drains the outbound queue until shutdown, writing each packet to the socket.
pub async fn send_loop(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    sessions: Arc<RwLock<SessionRegistry>>,
    sampler: Arc<BandwidthSampler>,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let sender = Sender {
        socket,
        sampler,
        running,
    };

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => sender.deliver(message, &sessions).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!("Send loop stopped");
}

struct Sender {
    socket: Arc<UdpSocket>,
    sampler: Arc<BandwidthSampler>,
    running: Arc<AtomicBool>,
}

impl Sender {
    async fn deliver(&self, message: Outbound, sessions: &RwLock<SessionRegistry>) {
        match message {
            Outbound::SendPacket { packet, addr } => {
                self.send(&encode(&packet), addr).await;
            }
            Outbound::SendToPlayer { packet, player_id } => {
                // Resolve as late as possible so a concurrent eviction wins
                let addr = sessions.read().await.address_of(player_id);
                match addr {
                    Some(addr) => self.send(&encode(&packet), addr).await,
                    None => debug!(
                        "Dropping {:?} for player {}, no longer connected",
                        packet.kind(),
                        player_id
                    ),
                }
            }
            Outbound::BroadcastPacket { packet } => {
                let recipients = sessions.read().await.addresses();
                if recipients.is_empty() {
                    return;
                }

                let data = encode(&packet);
                for (_, addr) in recipients {
                    self.send(&data, addr).await;
                }
            }
        }
    }

    async fn send(&self, data: &[u8], addr: SocketAddr) {
        match self.socket.send_to(data, addr).await {
            Ok(len) => self.sampler.record_sent(len),
            Err(e) if self.running.load(Ordering::Acquire) => {
                error!("Failed to send packet to {}: {}", addr, e);
            }
            Err(_) => {}
        }
    }
}
