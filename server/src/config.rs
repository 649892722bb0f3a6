//! Tunables supplied by the host application.

use std::time::Duration;

/// Timing and capacity settings for a [`Server`](crate::network::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Fixed simulation step; the tick hook runs once per interval.
    pub tick_interval: Duration,
    /// Minimum time between two world state broadcasts.
    pub broadcast_interval: Duration,
    /// Time between two heartbeat cycles.
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeat cycles tolerated before a session is evicted.
    pub max_timeout_attempts: u32,
    /// Size of the player ID pool, i.e. the maximum number of live sessions.
    pub max_players: usize,
    /// Every this many ticks the full player list is broadcast.
    pub roster_interval_ticks: u64,
    /// Length of the bandwidth sampling window.
    pub bandwidth_window: Duration,
    /// How long `close` waits for each task before abandoning it.
    pub shutdown_timeout: Duration,
    /// Slack kept when sleeping between ticks so the loop wakes up early
    /// rather than late.
    pub sleep_margin: Duration,
    /// Upper bound on ticks run in one loop iteration after a stall.
    pub max_catch_up_ticks: u32,
}

impl ServerConfig {
    pub fn with_tick_rate(mut self, ticks_per_second: u32) -> Self {
        self.tick_interval = rate_to_interval(ticks_per_second);
        self
    }

    pub fn with_broadcast_rate(mut self, broadcasts_per_second: u32) -> Self {
        self.broadcast_interval = rate_to_interval(broadcasts_per_second);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_interval: rate_to_interval(60),
            broadcast_interval: rate_to_interval(20),
            heartbeat_interval: Duration::from_millis(2500),
            max_timeout_attempts: 10,
            max_players: 31,
            roster_interval_ticks: 300,
            bandwidth_window: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            sleep_margin: Duration::from_millis(1),
            max_catch_up_ticks: 10,
        }
    }
}

fn rate_to_interval(per_second: u32) -> Duration {
    Duration::from_secs_f64(1.0 / per_second.max(1) as f64)
}
