//! UDP client transport: bincode datagrams in, coordinator events out

use crate::client_manager::ClientManager;
use crate::error::TransportError;
use crate::transport::{ClientCommand, ClientEvent, ClientTransport};
use async_trait::async_trait;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{MatchPreferences, Packet, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Client transport over a single UDP socket
pub struct UdpTransport {
    addr: SocketAddr,
    id_prefix: String,
    max_clients: usize,
    client_timeout: Duration,
    local_addr: Option<SocketAddr>,
}

impl UdpTransport {
    pub fn new(
        addr: SocketAddr,
        id_prefix: &str,
        max_clients: usize,
        client_timeout: Duration,
    ) -> Self {
        Self {
            addr,
            id_prefix: id_prefix.to_string(),
            max_clients,
            client_timeout,
            local_addr: None,
        }
    }

    /// Bound address once open; differs from the configured one for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(
        socket: Arc<UdpSocket>,
        clients: Arc<RwLock<ClientManager>>,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) {
        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                let received = tokio::select! {
                    _ = events.closed() => break,
                    received = socket.recv_from(&mut buffer) => received,
                };

                match received {
                    Ok((len, addr)) => match deserialize::<Packet>(&buffer[0..len]) {
                        Ok(packet) => {
                            let outcome =
                                Self::handle_packet(&socket, &clients, &events, packet, addr).await;
                            if outcome.is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!("Failed to deserialize packet from {}", addr),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            debug!("Network receiver stopped");
        });
    }

    /// Turns one datagram into at most a couple of events. Errors only when
    /// the coordinator is gone.
    async fn handle_packet(
        socket: &UdpSocket,
        clients: &RwLock<ClientManager>,
        events: &mpsc::UnboundedSender<ClientEvent>,
        packet: Packet,
        addr: SocketAddr,
    ) -> Result<(), mpsc::error::SendError<ClientEvent>> {
        if let Packet::Connect { client_version } = packet {
            info!(
                "Client connecting from {} (version: {})",
                addr, client_version
            );

            if client_version != PROTOCOL_VERSION {
                let reason = format!("Unsupported client version {}", client_version);
                Self::reply(socket, Packet::Disconnected { reason }, addr).await;
                return Ok(());
            }

            // Reconnect from the same address replaces the old client
            let (previous, client_id) = {
                let mut clients = clients.write().await;
                let previous = clients.find_client_by_addr(addr);
                if let Some(existing_id) = &previous {
                    clients.remove_client(existing_id);
                }
                (previous, clients.add_client(addr))
            };

            if let Some(existing_id) = previous {
                events.send(ClientEvent::Disconnected {
                    client_id: existing_id,
                })?;
            }

            match client_id {
                Some(client_id) => {
                    let connected = Packet::Connected {
                        client_id: client_id.clone(),
                    };
                    Self::reply(socket, connected, addr).await;
                    events.send(ClientEvent::Connected { client_id })?;
                }
                None => {
                    let reason = "Server full".to_string();
                    Self::reply(socket, Packet::Disconnected { reason }, addr).await;
                }
            }
            return Ok(());
        }

        let client_id = clients.write().await.touch(addr);
        let Some(client_id) = client_id else {
            debug!("Dropping packet from unknown client at {}", addr);
            return Ok(());
        };

        match packet {
            Packet::RequestName => events.send(ClientEvent::RequestName { client_id }),
            Packet::FindMatch { level, allow_lower } => events.send(ClientEvent::FindMatch {
                client_id,
                preferences: MatchPreferences { level, allow_lower },
            }),
            Packet::Data { payload } => events.send(ClientEvent::Data { client_id, payload }),
            Packet::Heartbeat => Ok(()),
            Packet::Disconnect => {
                clients.write().await.remove_client(&client_id);
                events.send(ClientEvent::Disconnected { client_id })
            }
            _ => {
                warn!("Unexpected packet type from client at {}", addr);
                Ok(())
            }
        }
    }

    /// Spawns task that processes outgoing commands
    fn spawn_network_sender(
        socket: Arc<UdpSocket>,
        clients: Arc<RwLock<ClientManager>>,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) {
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    ClientCommand::Send { client_id, packet } => {
                        let addr = clients.read().await.addr_of(&client_id);
                        match addr {
                            Some(addr) => Self::reply(&socket, packet, addr).await,
                            None => debug!("No address for client {}, dropping packet", client_id),
                        }
                    }
                    ClientCommand::Close { client_id, reason } => {
                        let addr = {
                            let mut clients = clients.write().await;
                            let addr = clients.addr_of(&client_id);
                            clients.remove_client(&client_id);
                            addr
                        };
                        if let Some(addr) = addr {
                            Self::reply(&socket, Packet::Disconnected { reason }, addr).await;
                        }
                    }
                }
            }
            debug!("Network sender stopped");
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(
        clients: Arc<RwLock<ClientManager>>,
        events: mpsc::UnboundedSender<ClientEvent>,
        timeout: Duration,
    ) {
        tokio::spawn(async move {
            let period = (timeout / 4).max(Duration::from_millis(50));
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = events.closed() => break,
                    _ = interval.tick() => {}
                }

                let timed_out = clients.write().await.check_timeouts(timeout);
                for client_id in timed_out {
                    info!("Client {} timed out", client_id);
                    if events.send(ClientEvent::Disconnected { client_id }).is_err() {
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    async fn reply(socket: &UdpSocket, packet: Packet, addr: SocketAddr) {
        if let Err(e) = Self::send_packet_impl(socket, &packet, addr).await {
            error!("Failed to send packet to {}: {}", addr, e);
        }
    }
}

#[async_trait]
impl ClientTransport for UdpTransport {
    async fn open(
        &mut self,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<mpsc::UnboundedSender<ClientCommand>, TransportError> {
        if self.local_addr.is_some() {
            return Err(TransportError::AlreadyOpen);
        }

        let socket = UdpSocket::bind(self.addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.addr.to_string(),
                source,
            })?;
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("Client listener on {}", local_addr);

        let socket = Arc::new(socket);
        let clients = Arc::new(RwLock::new(ClientManager::new(
            &self.id_prefix,
            self.max_clients,
        )));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self::spawn_network_receiver(Arc::clone(&socket), Arc::clone(&clients), events.clone());
        Self::spawn_network_sender(socket, Arc::clone(&clients), commands_rx);
        Self::spawn_timeout_checker(clients, events, self.client_timeout);

        Ok(commands_tx)
    }
}
