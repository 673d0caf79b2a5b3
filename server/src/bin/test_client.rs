use bincode::{deserialize, serialize};
use clap::Parser;
use log::{info, warn};
use shared::{Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::interval;

/// Test client: connects, asks for a name and a match, then prints whatever
/// the instance sends until the match ends or the time runs out.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Instance client address
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,

    /// Skill level to queue at
    #[arg(short = 'l', long, default_value = "0")]
    level: i64,

    /// Accept opponents below our level
    #[arg(short = 'a', long)]
    allow_lower: bool,

    /// Seconds to keep listening
    #[arg(short = 't', long, default_value = "30")]
    seconds: u64,
}

async fn send(
    socket: &UdpSocket,
    packet: &Packet,
    server: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&serialize(packet)?, server).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let connect = Packet::Connect {
        client_version: PROTOCOL_VERSION,
    };
    send(&socket, &connect, args.server).await?;

    let mut buf = [0u8; 2048];
    let mut heartbeat = interval(Duration::from_secs(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.seconds);

    loop {
        let received = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = heartbeat.tick() => {
                send(&socket, &Packet::Heartbeat, args.server).await?;
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, _) = match received {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Receive failed: {}", e);
                continue;
            }
        };

        let packet = match deserialize::<Packet>(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to deserialize packet: {}", e);
                continue;
            }
        };
        println!("Received packet: {:?}", packet);

        match packet {
            Packet::Connected { client_id } => {
                info!("Connected as {}", client_id);
                send(&socket, &Packet::RequestName, args.server).await?;
            }
            Packet::NameAssigned { name } => {
                info!("Playing as {}", name);
                send(
                    &socket,
                    &Packet::FindMatch {
                        level: args.level,
                        allow_lower: args.allow_lower,
                    },
                    args.server,
                )
                .await?;
            }
            Packet::Matched { opponent } => {
                info!("Matched against {}", opponent);
                send(
                    &socket,
                    &Packet::Data {
                        payload: "hello".to_string(),
                    },
                    args.server,
                )
                .await?;
            }
            Packet::OpponentLeft { name } => {
                info!("{} left", name);
                break;
            }
            Packet::Disconnected { reason } => {
                info!("Disconnected: {}", reason);
                return Ok(());
            }
            _ => {}
        }
    }

    send(&socket, &Packet::Disconnect, args.server).await?;
    println!("Test client finished");
    Ok(())
}
