//! # Game Server Coordination Library
//!
//! This library lets several game-server instances share one population of
//! clients. Instances talk over a common message bus and a shared registry;
//! exactly one of them at a time acts as leader and makes the decisions that
//! must be globally consistent, while every instance relays gameplay traffic
//! for the clients attached to it.
//!
//! ## Core Responsibilities
//!
//! ### Leader Election
//! Each instance runs a simplified Raft election (no replicated log) over the
//! control channel. Randomized election timeouts, term numbers and a single
//! vote per term keep leadership unique once messages settle. An optional
//! phi-accrual detector lets followers tolerate a slow but alive leader.
//!
//! ### Arbitration
//! The leader alone:
//! - Issues display names that no live instance already uses
//! - Pairs players through a table of skill bins
//! - Announces the former clients of a restarted instance as disconnected,
//!   then clears that instance to start
//!
//! ### Relaying
//! Decisions and gameplay data travel on the relay channel. Whichever
//! instance holds the addressed client delivers it.
//!
//! ## Architecture Design
//!
//! ### Single-Task Event Loop
//! Every instance is one [`coordinator::Coordinator`] driving its election
//! engine, bin table and client roster from one loop, so none of that state
//! needs locking. Registry calls are spawned off the loop.
//!
//! ### Pure Election Core
//! [`consensus::Engine`] is a plain state machine: inputs in, outputs out.
//! It never sleeps or publishes, which keeps every transition unit-testable.
//!
//! ### Startup Gate
//! A starting instance announces itself and keeps its client listener closed
//! until the leader has cleaned up after any previous incarnation.
//!
//! ## Module Organization
//!
//! - `arbiter`: skill bins, name allocation, crash recovery notices
//! - `bus`: control and relay channels, in-process implementation
//! - `client_manager`: address to client id bookkeeping for UDP clients
//! - `config`: typed settings with defaults
//! - `consensus`: the election state machine
//! - `coordinator`: the per-instance event loop
//! - `error`: error types
//! - `failure_detector`: heartbeat statistics and phi scoring
//! - `network`: UDP client transport
//! - `registry`: shared registry contract, in-process implementation
//! - `roster`: client id to display name and opponent
//! - `transport`: the client transport seam
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::bus::InMemoryBus;
//! use server::config::InstanceConfig;
//! use server::coordinator::Coordinator;
//! use server::network::UdpTransport;
//! use server::registry::InMemoryRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(InMemoryBus::new());
//!     let registry = Arc::new(InMemoryRegistry::new());
//!     let config = InstanceConfig::default();
//!     let transport = UdpTransport::new(
//!         config.client_addr,
//!         &config.instance_id,
//!         config.max_clients,
//!         config.client_timeout,
//!     );
//!
//!     let (coordinator, handle) =
//!         Coordinator::new(config, bus, registry, Box::new(transport));
//!     tokio::spawn(coordinator.run());
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.shutdown();
//! }
//! ```

pub mod arbiter;
pub mod bus;
pub mod client_manager;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod failure_detector;
pub mod network;
pub mod registry;
pub mod roster;
pub mod transport;
