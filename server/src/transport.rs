//! Boundary between a coordinator and its locally connected clients.
//!
//! The coordinator never sees sockets. It opens a [`ClientTransport`] once the
//! instance is cleared to start, receives [`ClientEvent`]s and answers with
//! [`ClientCommand`]s. Client ids are chosen by the transport and must be
//! unique across the cluster, since name decrees are addressed by client id.

use crate::error::TransportError;
use async_trait::async_trait;
use shared::{MatchPreferences, Packet};
use tokio::sync::{mpsc, oneshot};

/// Something a local client did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected {
        client_id: String,
    },
    RequestName {
        client_id: String,
    },
    FindMatch {
        client_id: String,
        preferences: MatchPreferences,
    },
    Data {
        client_id: String,
        payload: String,
    },
    /// Explicit disconnect or liveness timeout.
    Disconnected {
        client_id: String,
    },
}

/// Something the coordinator wants done to a local client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Send { client_id: String, packet: Packet },
    /// Tells the client why and forgets it without raising a
    /// [`ClientEvent::Disconnected`].
    Close { client_id: String, reason: String },
}

#[async_trait]
pub trait ClientTransport: Send {
    /// Starts accepting clients. Events are pushed into `events` until it is
    /// closed; the returned sender takes commands.
    async fn open(
        &mut self,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<mpsc::UnboundedSender<ClientCommand>, TransportError>;
}

/// The far side of a [`ChannelTransport`]: injects client events and reads
/// the commands the coordinator issued.
#[derive(Debug)]
pub struct ClientPort {
    events: mpsc::UnboundedSender<ClientEvent>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl ClientPort {
    /// Returns false once the coordinator has stopped listening.
    pub fn send(&self, event: ClientEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn connect(&self, client_id: &str) -> bool {
        self.send(ClientEvent::Connected {
            client_id: client_id.to_string(),
        })
    }

    /// Waits for the next packet addressed to `client_id`, skipping
    /// everything else.
    pub async fn next_packet_for(&mut self, client_id: &str) -> Option<Packet> {
        while let Some(command) = self.commands.recv().await {
            if let ClientCommand::Send {
                client_id: target,
                packet,
            } = command
            {
                if target == client_id {
                    return Some(packet);
                }
            }
        }
        None
    }
}

/// In-process transport. Opening it hands a [`ClientPort`] to whoever holds
/// the matching [`PendingPort`].
#[derive(Debug)]
pub struct ChannelTransport {
    opened: Option<oneshot::Sender<ClientPort>>,
}

/// Resolves to a [`ClientPort`] once the transport has been opened.
#[derive(Debug)]
pub struct PendingPort {
    receiver: oneshot::Receiver<ClientPort>,
}

impl PendingPort {
    /// Waits for the transport to open. `None` if it was dropped unopened.
    pub async fn opened(self) -> Option<ClientPort> {
        self.receiver.await.ok()
    }

    /// Non-blocking check; gives the pending port back if not open yet.
    pub fn try_opened(mut self) -> Result<ClientPort, PendingPort> {
        match self.receiver.try_recv() {
            Ok(port) => Ok(port),
            Err(_) => Err(self),
        }
    }
}

impl ChannelTransport {
    pub fn new() -> (Self, PendingPort) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                opened: Some(sender),
            },
            PendingPort { receiver },
        )
    }
}

#[async_trait]
impl ClientTransport for ChannelTransport {
    async fn open(
        &mut self,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> Result<mpsc::UnboundedSender<ClientCommand>, TransportError> {
        let opened = self.opened.take().ok_or(TransportError::AlreadyOpen)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        // A dropped PendingPort just means nobody is watching.
        let _ = opened.send(ClientPort {
            events,
            commands: commands_rx,
        });
        Ok(commands_tx)
    }
}
