//! Connection bookkeeping for clients attached to this instance
//!
//! This module tracks which network address belongs to which client id:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - Liveness tracking from any packet a client sends
//! - Client capacity management and address lookup
//!
//! Client ids are prefixed with the owning instance's id so they stay unique
//! across the cluster.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A connected client
#[derive(Debug)]
pub struct Client {
    /// Cluster-unique client identifier
    pub id: String,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: String, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Marks the client as active now
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all clients connected to one instance
///
/// Enforces the capacity limit and hands out ids of the form
/// `<instance>-<n>`.
pub struct ClientManager {
    /// Connected clients indexed by their id
    clients: HashMap<String, Client>,
    /// Prefix for generated client ids
    id_prefix: String,
    /// Next sequence number for new connections
    next_client_id: u64,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    pub fn new(id_prefix: &str, max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            id_prefix: id_prefix.to_string(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if the instance is at
    /// capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<String> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = format!("{}-{}", self.id_prefix, self.next_client_id);
        self.next_client_id += 1;

        info!("Client {} connected from {}", client_id, addr);
        self.clients
            .insert(client_id.clone(), Client::new(client_id.clone(), addr));

        Some(client_id)
    }

    /// Removes a client
    ///
    /// Returns true if the client was found and removed, false if they were
    /// already gone.
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<String> {
        self.clients
            .values()
            .find(|client| client.addr == addr)
            .map(|client| client.id.clone())
    }

    /// Refreshes the liveness of whichever client sent from `addr`
    ///
    /// Returns the client's id, or None for an unknown address.
    pub fn touch(&mut self, addr: SocketAddr) -> Option<String> {
        self.clients
            .values_mut()
            .find(|client| client.addr == addr)
            .map(|client| {
                client.touch();
                client.id.clone()
            })
    }

    pub fn addr_of(&self, client_id: &str) -> Option<SocketAddr> {
        self.clients.get(client_id).map(|client| client.addr)
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed client ids so the coordinator can treat them as
    /// disconnects.
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<String> {
        let timed_out: Vec<String> = self
            .clients
            .values()
            .filter(|client| client.is_timed_out(timeout))
            .map(|client| client.id.clone())
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
