use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::{Server, ServerConfig, SessionState};
use std::time::Duration;
use tokio::time::interval;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,
    /// Simulation ticks per second
    #[clap(short, long, default_value = "60")]
    tick_rate: u32,
    /// World state broadcasts per second
    #[clap(short, long, default_value = "20")]
    broadcast_rate: u32,
    /// Milliseconds between heartbeat checks
    #[clap(long, default_value = "2500")]
    heartbeat_ms: u64,
    /// Unanswered heartbeat checks before a player is dropped
    #[clap(long, default_value = "10")]
    max_timeout_attempts: u32,
    /// Maximum number of simultaneous players
    #[clap(short, long, default_value = "31")]
    max_players: usize,
    /// Ticks between full player list broadcasts
    #[clap(long, default_value = "300")]
    roster_interval: u64,
    /// Seconds between stats log lines, 0 disables them
    #[clap(long, default_value = "10")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        max_timeout_attempts: args.max_timeout_attempts,
        max_players: args.max_players,
        roster_interval_ticks: args.roster_interval,
        ..ServerConfig::default()
    }
    .with_tick_rate(args.tick_rate)
    .with_broadcast_rate(args.broadcast_rate);

    let address = format!("{}:{}", args.host, args.port);
    let mut server = match Server::bind(&address, config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server on {}: {}", address, e);
            return Err(e.into());
        }
    };

    server.start(|_delta_seconds: f32| {})?;

    let mut stats_timer = interval(Duration::from_secs(args.stats_interval.max(1)));
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = stats_timer.tick(), if args.stats_interval > 0 => {
                let stats = server.bandwidth_stats();
                let sessions = server.session_snapshot().await;
                let timing_out = sessions
                    .iter()
                    .filter(|s| matches!(s.state(), SessionState::TimingOut(_)))
                    .count();
                info!(
                    "Players: {} ({} timing out), down: {} B/s, up: {} B/s, \
                     packets in/out: {}/{}, avg processing: {:?}",
                    sessions.len(),
                    timing_out,
                    stats.bytes_per_second_down,
                    stats.bytes_per_second_up,
                    stats.packets_received,
                    stats.packets_sent,
                    stats.average_processing_time
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    server.close().await;
    Ok(())
}
