//! # Session Server Library
//!
//! This library provides an authoritative UDP session server for small
//! real-time multiplayer games. It admits clients, assigns them compact player
//! IDs, relays their movement to every other player at a fixed rate, and
//! evicts clients that stop answering.
//!
//! ## Core Responsibilities
//!
//! ### Session Management
//! Handles the complete lifecycle of a player session:
//! - Admission and player ID assignment from a bounded pool
//! - Reconnection under a stable client identifier, keeping the player ID
//! - Voluntary disconnects and host-requested disconnects
//! - Heartbeat probing and eviction of silent clients
//!
//! ### State Broadcasting
//! Regularly transmits the latest movement of every player to everyone
//! connected. The full player list is sent periodically as well, so late
//! joiners converge on the roster without asking.
//!
//! ### Fixed-Step Simulation
//! A host supplied [`TickHook`] runs at a fixed tick rate, independent of
//! the broadcast rate, with sleep compensation for time spent in the hook.
//!
//! ## Architecture Design
//!
//! ### Task Pipeline
//! Receiving, decoding, sending, heartbeats and the simulation each run as
//! their own tokio task. Datagrams are copied off the socket and queued, so
//! slow packet handling never stalls intake. All writes go through a single
//! outbound queue.
//!
//! ### Shared Registry
//! Sessions live in one [`SessionRegistry`] behind an async read-write lock.
//! Every change to it happens under the write lock, and packets addressed to
//! a player are only resolved to an endpoint when they are sent, so a player
//! evicted in the meantime receives nothing.
//!
//! ### Unreliable Delivery
//! The protocol runs over plain UDP. Packets about players that are already
//! gone are expected and ignored, and malformed datagrams are dropped without
//! affecting anyone else.
//!
//! ## Module Organization
//!
//! - `config`: tunables such as tick rate, broadcast rate and pool size
//! - `session`: the session registry and player ID pool
//! - `protocol`: the per-packet state machine and heartbeat cycle
//! - `transport`: socket receive and send loops
//! - `dispatch`: decoding and applying queued datagrams
//! - `simulation`: the fixed-step loop and broadcast scheduling
//! - `stats`: bandwidth and processing time diagnostics
//! - `network`: the [`Server`] tying everything together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default().with_tick_rate(60).with_broadcast_rate(20);
//!     let mut server = Server::bind("127.0.0.1:8080", config).await?;
//!
//!     // The hook runs once per tick with the tick length in seconds
//!     server.start(|dt: f32| {
//!         let _ = dt;
//!     })?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod simulation;
pub mod stats;
pub mod transport;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use network::Server;
pub use session::{Session, SessionRegistry, SessionState};
pub use simulation::{Clock, ManualClock, SystemClock, TickHook};
pub use stats::BandwidthStats;
