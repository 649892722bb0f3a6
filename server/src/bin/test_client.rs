use clap::Parser;
use shared::{decode, encode, MovementState, Packet, MAX_PACKET_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, Instant};

/// Minimal client for poking a running server by hand
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Stable client identifier, reuse it to test reconnects
    #[clap(short, long, default_value = "test-client")]
    identifier: String,
    /// Display name
    #[clap(short, long, default_value = "TestClient")]
    name: String,
    /// Character selection
    #[clap(short, long, default_value = "default")]
    character: String,
    /// How long to stay connected
    #[clap(long, default_value = "10")]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let connect = Packet::Connect {
        identifier: args.identifier.clone(),
        name: args.name.clone(),
        character: args.character.clone(),
    };

    println!("Sending connect to {}", args.server);
    socket.send_to(&encode(&connect), args.server).await?;

    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut player_id = loop {
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .map_err(|_| "no reply from server")??;

        match decode(&buf[..len]) {
            Ok(Packet::ConnectAccept(info)) => {
                println!("Connected as player {} ({})", info.player_id, info.name);
                break info.player_id;
            }
            Ok(other) => println!("Ignoring {:?} while connecting", other.kind()),
            Err(e) => println!("Failed to decode reply: {}", e),
        }
    };

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut movement_timer = interval(Duration::from_millis(100));
    let mut step = 0u32;

    while Instant::now() < deadline {
        tokio::select! {
            _ = movement_timer.tick() => {
                // Walk in a circle
                let angle = step as f32 / 20.0;
                let movement = MovementState::new(
                    player_id,
                    angle.cos() * 50.0,
                    angle.sin() * 50.0,
                    angle.to_degrees() % 360.0,
                );
                socket.send_to(&encode(&Packet::Movement(movement)), args.server).await?;
                step += 1;
            }
            result = socket.recv_from(&mut buf) => {
                let (len, _) = result?;
                match decode(&buf[..len]) {
                    Ok(Packet::TimeoutCheck { player_id: id }) => {
                        println!("Answering timeout check");
                        socket
                            .send_to(&encode(&Packet::TimeoutAck { player_id: id }), args.server)
                            .await?;
                    }
                    Ok(Packet::ReconnectRequest) => {
                        println!("Server asked for a reconnect");
                        socket.send_to(&encode(&connect), args.server).await?;
                    }
                    Ok(Packet::ConnectAccept(info)) => {
                        println!("Reconnected as player {}", info.player_id);
                        player_id = info.player_id;
                    }
                    Ok(Packet::WorldStateUpdate { players }) => {
                        for p in &players {
                            println!(
                                "  Player {}: ({:.1}, {:.1}) rot {:.1}",
                                p.player_id, p.x, p.y, p.rotation
                            );
                        }
                    }
                    Ok(Packet::PlayerListResponse { players }) => {
                        println!("Roster: {} players", players.len());
                        for p in players {
                            println!("  {} {} [{}]", p.player_id, p.name, p.character);
                        }
                    }
                    Ok(Packet::Disconnect { .. }) => {
                        println!("Disconnected by server");
                        return Ok(());
                    }
                    Ok(other) => println!("Unexpected packet: {:?}", other),
                    Err(e) => println!("Failed to decode packet: {}", e),
                }
            }
        }
    }

    println!("Sending disconnect");
    socket
        .send_to(&encode(&Packet::Disconnect { player_id }), args.server)
        .await?;

    println!("Test client finished");
    Ok(())
}
