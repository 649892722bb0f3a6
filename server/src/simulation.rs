//! Fixed-step simulation loop with a decoupled broadcast rate
//!
//! The loop measures elapsed time on a [`Clock`], feeds it to a
//! [`FixedStep`] accumulator and runs the [`TickHook`] once per full tick
//! interval. After the due ticks it sleeps only for what is left of the
//! current tick, minus the hook cost and a small margin, so a slow hook
//! never pushes the next tick late.
//!
//! World state goes out through a separate [`BroadcastGate`] at a lower rate
//! than the tick rate, so simulation fidelity and network bandwidth can be
//! tuned independently. Every `roster_interval_ticks` ticks the full player
//! list is broadcast as well, letting late joiners and desynced clients
//! converge.

use crate::config::ServerConfig;
use crate::session::SessionRegistry;
use crate::transport::{Outbound, OutboundSender};
use log::{debug, warn};
use shared::{split_player_list, split_world_state, Packet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};

/// Monotonic time source.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

/// Per-tick extension point supplied by the host.
pub trait TickHook: Send + 'static {
    /// Called once per fixed step with the step length in seconds.
    fn on_tick(&mut self, delta_seconds: f32);
}

impl<F> TickHook for F
where
    F: FnMut(f32) + Send + 'static,
{
    fn on_tick(&mut self, delta_seconds: f32) {
        self(delta_seconds)
    }
}

/// Fixed timestep accumulator.
#[derive(Debug)]
pub struct FixedStep {
    interval: Duration,
    accumulator: Duration,
    last: Instant,
    max_catch_up: u32,
}

impl FixedStep {
    pub fn new(interval: Duration, start: Instant, max_catch_up: u32) -> Self {
        Self {
            interval: interval.max(Duration::from_nanos(1)),
            accumulator: Duration::ZERO,
            last: start,
            max_catch_up: max_catch_up.max(1),
        }
    }

    /// Accumulates the time since the previous call and returns how many
    /// ticks are due. Whole ticks beyond the catch-up limit are discarded.
    pub fn advance(&mut self, now: Instant) -> u32 {
        self.accumulator += now.saturating_duration_since(self.last);
        self.last = now;

        let interval = self.interval.as_nanos();
        let accumulated = self.accumulator.as_nanos();
        let due = accumulated / interval;
        self.accumulator = Duration::from_nanos((accumulated % interval) as u64);

        let ticks = due.min(self.max_catch_up as u128) as u32;
        if due > ticks as u128 {
            warn!(
                "Simulation fell behind, skipping {} ticks",
                due - ticks as u128
            );
        }
        ticks
    }

    /// Time until the accumulator holds another full tick.
    pub fn until_next_tick(&self) -> Duration {
        self.interval.saturating_sub(self.accumulator)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Lets one broadcast through per interval.
///
/// Deadlines stay on a fixed grid (start + k * interval) so rounding in the
/// tick interval does not slowly stretch the broadcast period. If the gate
/// is checked more than a whole interval late it resynchronizes instead of
/// firing a burst.
#[derive(Debug)]
pub struct BroadcastGate {
    interval: Duration,
    next_due: Instant,
}

impl BroadcastGate {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next_due: start + interval,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        if now < self.next_due {
            return false;
        }

        self.next_due += self.interval;
        if self.next_due <= now {
            self.next_due = now + self.interval;
        }
        true
    }
}

pub struct Simulation<C: Clock = SystemClock> {
    clock: C,
    step: FixedStep,
    gate: BroadcastGate,
    sessions: Arc<RwLock<SessionRegistry>>,
    outbound: OutboundSender,
    hook: Box<dyn TickHook>,
    sleep_margin: Duration,
    roster_interval_ticks: u64,

    ticks: u64,
    broadcasts: u64,

    // Loop rate diagnostics, reported once per second
    rate_window_start: Instant,
    ticks_in_window: u32,
    iterations_in_window: u32,
}

impl<C: Clock> Simulation<C> {
    pub fn new(
        config: &ServerConfig,
        clock: C,
        sessions: Arc<RwLock<SessionRegistry>>,
        outbound: OutboundSender,
        hook: Box<dyn TickHook>,
    ) -> Self {
        let start = clock.now();
        Self {
            step: FixedStep::new(config.tick_interval, start, config.max_catch_up_ticks),
            gate: BroadcastGate::new(config.broadcast_interval, start),
            clock,
            sessions,
            outbound,
            hook,
            sleep_margin: config.sleep_margin,
            roster_interval_ticks: config.roster_interval_ticks,
            ticks: 0,
            broadcasts: 0,
            rate_window_start: start,
            ticks_in_window: 0,
            iterations_in_window: 0,
        }
    }

    /// Total ticks run so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Total world state broadcasts sent so far.
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts
    }

    /// Runs the ticks that are due and returns how long the loop may sleep.
    pub async fn run_once(&mut self) -> Duration {
        let started = self.clock.now();
        let due = self.step.advance(started);
        let delta_seconds = self.step.interval().as_secs_f32();

        for _ in 0..due {
            self.tick(delta_seconds).await;
        }

        let now = self.clock.now();
        self.track_rate(due, now);

        let hook_cost = now.saturating_duration_since(started);
        self.step
            .until_next_tick()
            .saturating_sub(hook_cost)
            .saturating_sub(self.sleep_margin)
    }

    /// Drives the loop until shutdown is requested.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = self.run_once().await;
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!("Simulation stopped after {} ticks", self.ticks);
    }

    async fn tick(&mut self, delta_seconds: f32) {
        self.hook.on_tick(delta_seconds);
        self.ticks += 1;

        if self.roster_interval_ticks > 0 && self.ticks % self.roster_interval_ticks == 0 {
            self.broadcast_roster().await;
        }

        if self.gate.ready(self.clock.now()) {
            self.broadcast_world_state().await;
        }
    }

    async fn broadcast_world_state(&mut self) {
        let players = self.sessions.read().await.movement_states();
        if players.is_empty() {
            return;
        }

        self.broadcasts += 1;
        for packet in split_world_state(players) {
            self.queue(packet);
        }
    }

    async fn broadcast_roster(&mut self) {
        let players = self.sessions.read().await.roster();
        if players.is_empty() {
            return;
        }

        for packet in split_player_list(players) {
            self.queue(packet);
        }
    }

    fn queue(&self, packet: Packet) {
        if self
            .outbound
            .send(Outbound::BroadcastPacket { packet })
            .is_err()
        {
            debug!("Send loop stopped, dropping broadcast");
        }
    }

    fn track_rate(&mut self, ticks: u32, now: Instant) {
        self.ticks_in_window += ticks;
        self.iterations_in_window += 1;

        if now.saturating_duration_since(self.rate_window_start) >= Duration::from_secs(1) {
            debug!(
                "Fixed updates: {}, loop iterations: {}",
                self.ticks_in_window, self.iterations_in_window
            );
            self.rate_window_start = now;
            self.ticks_in_window = 0;
            self.iterations_in_window = 0;
        }
    }
}
