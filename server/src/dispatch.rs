//! Decodes queued datagrams and hands them to the session protocol.

use crate::error::ServerError;
use crate::protocol::SessionProtocol;
use crate::stats::BandwidthSampler;
use crate::transport::Datagram;
use log::{debug, warn};
use shared::decode;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Processes datagrams in queue order until shutdown or until the receive
/// loop goes away.
pub async fn dispatch_loop(
    mut inbound: mpsc::UnboundedReceiver<Datagram>,
    protocol: Arc<SessionProtocol>,
    sampler: Arc<BandwidthSampler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            datagram = inbound.recv() => match datagram {
                Some(datagram) => dispatch(&protocol, &sampler, datagram).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    debug!("Dispatch loop stopped");
}

/// Decodes one datagram and applies it. Malformed datagrams are dropped.
pub async fn dispatch(protocol: &SessionProtocol, sampler: &BandwidthSampler, datagram: Datagram) {
    let started = Instant::now();

    match decode(&datagram.data) {
        Ok(packet) => protocol.on_packet(packet, datagram.addr).await,
        Err(e) => warn!(
            "Dropping datagram from {}: {}",
            datagram.addr,
            ServerError::from(e)
        ),
    }

    sampler.record_processing(started.elapsed());
}
