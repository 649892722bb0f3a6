//! Server lifecycle: binds the socket, spawns the worker tasks and tears
//! them down again.
//!
//! Six tasks run once the server is started:
//! - **Receiver**: copies datagrams off the socket into the dispatch queue
//! - **Dispatcher**: decodes queued datagrams and applies them to the sessions
//! - **Sender**: drains the outbound queue onto the socket
//! - **Heartbeat**: checks and evicts unresponsive sessions
//! - **Simulation**: fixed-step ticks and world state broadcasts
//! - **Sampler**: rolls the bandwidth window
//!
//! All of them share one shutdown signal. [`Server::close`] raises it and
//! waits a bounded time for every task before abandoning it.

use crate::config::ServerConfig;
use crate::dispatch::dispatch_loop;
use crate::error::{Result, ServerError};
use crate::protocol::SessionProtocol;
use crate::session::{Session, SessionRegistry};
use crate::simulation::{Simulation, SystemClock, TickHook};
use crate::stats::{BandwidthSampler, BandwidthStats};
use crate::transport::{receive_loop, send_loop, Datagram, Outbound};
use log::{debug, info, warn};
use shared::PlayerId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Session server bound to a UDP endpoint
pub struct Server {
    config: ServerConfig,
    /// Taken by `close` so the port is released with the last task
    socket: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    sessions: Arc<RwLock<SessionRegistry>>,
    protocol: Arc<SessionProtocol>,
    sampler: Arc<BandwidthSampler>,

    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    closed: bool,
    started_at: Instant,
}

impl Server {
    /// Binds the socket and prepares the shared state. No task runs until
    /// [`start`](Self::start) is called.
    pub async fn bind(addr: &str, config: ServerConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let sessions = Arc::new(RwLock::new(SessionRegistry::new(config.max_players)));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let protocol = Arc::new(SessionProtocol::new(
            Arc::clone(&sessions),
            outbound_tx.clone(),
            config.max_timeout_attempts,
        ));

        Ok(Server {
            config,
            socket: Some(socket),
            local_addr,
            sessions,
            protocol,
            sampler: Arc::new(BandwidthSampler::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            tasks: Vec::new(),
            closed: false,
            started_at: Instant::now(),
        })
    }

    /// Spawns every worker task. `hook` runs once per simulation tick.
    ///
    /// Starting twice is a no-op. Starting after [`close`](Self::close)
    /// fails with [`ServerError::ShutdownInProgress`].
    pub fn start(&mut self, hook: impl TickHook) -> Result<()> {
        if self.closed {
            return Err(ServerError::ShutdownInProgress);
        }
        let Some(socket) = self.socket.clone() else {
            return Err(ServerError::ShutdownInProgress);
        };
        let Some(outbound_rx) = self.outbound_rx.take() else {
            debug!("Server already started");
            return Ok(());
        };

        self.running.store(true, Ordering::Release);
        self.started_at = Instant::now();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        self.spawn_receiver(Arc::clone(&socket), inbound_tx);
        self.spawn_dispatcher(inbound_rx);
        self.spawn_sender(socket, outbound_rx);
        self.spawn_heartbeat();
        self.spawn_simulation(Box::new(hook));
        self.spawn_sampler();

        info!(
            "Server started: {:.0}Hz ticks, {:.0}Hz broadcasts, {} player slots",
            1.0 / self.config.tick_interval.as_secs_f64(),
            1.0 / self.config.broadcast_interval.as_secs_f64(),
            self.config.max_players
        );
        Ok(())
    }

    fn spawn_receiver(
        &mut self,
        socket: Arc<UdpSocket>,
        inbound_tx: mpsc::UnboundedSender<Datagram>,
    ) {
        let handle = tokio::spawn(receive_loop(
            socket,
            inbound_tx,
            Arc::clone(&self.sampler),
            Arc::clone(&self.running),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(("receiver", handle));
    }

    fn spawn_dispatcher(&mut self, inbound_rx: mpsc::UnboundedReceiver<Datagram>) {
        let handle = tokio::spawn(dispatch_loop(
            inbound_rx,
            Arc::clone(&self.protocol),
            Arc::clone(&self.sampler),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(("dispatcher", handle));
    }

    fn spawn_sender(
        &mut self,
        socket: Arc<UdpSocket>,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let handle = tokio::spawn(send_loop(
            socket,
            outbound_rx,
            Arc::clone(&self.sessions),
            Arc::clone(&self.sampler),
            Arc::clone(&self.running),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.push(("sender", handle));
    }

    /// Spawns task that checks and evicts unresponsive sessions
    fn spawn_heartbeat(&mut self) {
        let protocol = Arc::clone(&self.protocol);
        let period = self.config.heartbeat_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // Skip the first tick since it fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        protocol.heartbeat_cycle().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Heartbeat loop stopped");
        });
        self.tasks.push(("heartbeat", handle));
    }

    fn spawn_simulation(&mut self, hook: Box<dyn TickHook>) {
        let simulation = Simulation::new(
            &self.config,
            SystemClock,
            Arc::clone(&self.sessions),
            self.outbound_tx.clone(),
            hook,
        );
        let handle = tokio::spawn(simulation.run(self.shutdown_tx.subscribe()));
        self.tasks.push(("simulation", handle));
    }

    /// Spawns task that closes a bandwidth window once per period
    fn spawn_sampler(&mut self) {
        let sampler = Arc::clone(&self.sampler);
        let period = self.config.bandwidth_window;
        let mut shutdown = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => sampler.roll_window(),
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.push(("sampler", handle));
    }

    /// Stops every task, waits for them to finish and closes the socket.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        info!("Server shutting down");
        self.running.store(false, Ordering::Release);
        // Fails only when no task was ever started
        let _ = self.shutdown_tx.send(true);

        let limit = self.config.shutdown_timeout;
        for (name, mut handle) in self.tasks.drain(..) {
            match timeout(limit, &mut handle).await {
                Ok(Ok(())) => debug!("{} task finished", name),
                Ok(Err(e)) => warn!("{} task ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("{} task did not stop within {:?}, aborting", name, limit);
                    handle.abort();
                    // Cancelled tasks still hold their socket until dropped
                    let _ = handle.await;
                }
            }
        }

        // Every task is gone, so this is the last reference
        self.socket = None;

        info!("Server stopped after {:?}", self.uptime());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Copies of all live sessions, ordered by player ID.
    pub async fn session_snapshot(&self) -> Vec<Session> {
        self.sessions.read().await.all()
    }

    pub fn bandwidth_stats(&self) -> BandwidthStats {
        self.sampler.snapshot()
    }

    /// Removes a player and sends them a disconnect notice.
    pub async fn request_disconnect(&self, player_id: PlayerId) -> bool {
        self.protocol.request_disconnect(player_id).await
    }

    /// Time since the server was started, or bound if not started yet.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if !self.closed {
            self.running.store(false, Ordering::Release);
            let _ = self.shutdown_tx.send(true);
        }
    }
}
