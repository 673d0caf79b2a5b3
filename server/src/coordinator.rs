//! One coordinator per instance.
//!
//! The coordinator owns the instance's consensus engine, the leader-only bin
//! table and the roster of local clients, and drives them from a single
//! event loop over:
//! - control frames (election traffic, `INSTANCE_UP`, `CLEARED_TO_START`)
//! - relay frames (name and match requests, decrees, data, disconnects)
//! - fired engine timers and completed background work
//! - events from the local client transport
//!
//! Registry access never happens on the loop itself; it is spawned off so a
//! slow registry cannot delay leader heartbeats. The transport is only opened
//! once the cluster leader has cleared this instance to start.

use crate::arbiter::{allocate_name, random_name, recovery_notices, Arbiter, MatchOutcome};
use crate::bus::{BusSubscription, MessageBus};
use crate::config::InstanceConfig;
use crate::consensus::{Engine, Input, Output, Role, TimerKind, TimerToken};
use crate::registry::Registry;
use crate::roster::Roster;
use crate::transport::{ClientCommand, ClientEvent, ClientTransport};
use log::{debug, error, info, warn};
use serde_json::Value;
use shared::{Channel, ControlMessage, Packet, RelayMessage, Term};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Snapshot of an instance, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub role: Role,
    pub term: Term,
    pub leader: Option<String>,
    /// Cleared to start and accepting clients.
    pub cleared: bool,
}

impl InstanceStatus {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

#[derive(Debug)]
enum Event {
    Timer(TimerToken),
    /// Own registry entry wiped after clearance.
    Cleared,
    RecoveryDone(String),
    Shutdown,
}

/// Handle for observing and stopping a running [`Coordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    status: watch::Receiver<InstanceStatus>,
    events: mpsc::UnboundedSender<Event>,
}

impl CoordinatorHandle {
    pub fn status(&self) -> InstanceStatus {
        self.status.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader()
    }

    /// Waits until the status satisfies `ready`. Returns `None` if the
    /// coordinator stopped first.
    pub async fn wait_for<F>(&mut self, mut ready: F) -> Option<InstanceStatus>
    where
        F: FnMut(&InstanceStatus) -> bool,
    {
        loop {
            {
                let status = self.status.borrow_and_update();
                if ready(&*status) {
                    return Some(status.clone());
                }
            }
            self.status.changed().await.ok()?;
        }
    }

    /// Asks the coordinator to leave the cluster and stop.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

pub struct Coordinator {
    config: InstanceConfig,
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn Registry>,
    transport: Box<dyn ClientTransport>,
    engine: Engine,
    arbiter: Arbiter,
    roster: Roster,
    control: BusSubscription,
    relay: BusSubscription,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    client_tx: mpsc::UnboundedSender<ClientEvent>,
    client_rx: mpsc::UnboundedReceiver<ClientEvent>,
    commands: Option<mpsc::UnboundedSender<ClientCommand>>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    announcer: Option<JoinHandle<()>>,
    recovering: HashSet<String>,
    /// Local clients with a name request in flight.
    naming: HashSet<String>,
    clearing: bool,
    cleared: bool,
    status: watch::Sender<InstanceStatus>,
}

impl Coordinator {
    /// Builds a coordinator and subscribes it to the bus. Nothing runs until
    /// [`Coordinator::run`] is awaited.
    pub fn new(
        config: InstanceConfig,
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn Registry>,
        transport: Box<dyn ClientTransport>,
    ) -> (Self, CoordinatorHandle) {
        let engine = Engine::new(config.instance_id.clone(), config.election.clone());
        let arbiter = Arbiter::new(config.arbiter.skill_levels);
        let control = bus.subscribe(Channel::Control);
        let relay = bus.subscribe(Channel::Relay);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(InstanceStatus {
            instance_id: config.instance_id.clone(),
            role: engine.role(),
            term: engine.term(),
            leader: None,
            cleared: false,
        });

        let handle = CoordinatorHandle {
            status: status_rx,
            events: events_tx.clone(),
        };

        let coordinator = Self {
            config,
            bus,
            registry,
            transport,
            engine,
            arbiter,
            roster: Roster::new(),
            control,
            relay,
            events_tx,
            events_rx,
            client_tx,
            client_rx,
            commands: None,
            timers: HashMap::new(),
            announcer: None,
            recovering: HashSet::new(),
            naming: HashSet::new(),
            clearing: false,
            cleared: false,
            status,
        };
        (coordinator, handle)
    }

    pub fn id(&self) -> &str {
        &self.config.instance_id
    }

    /// Gate for all leader-only work.
    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    /// Runs until shutdown is requested or the bus goes away.
    pub async fn run(mut self) {
        let id = self.config.instance_id.clone();
        info!("Instance {} starting", id);
        if let Err(e) = self.registry.add_instance(&id).await {
            warn!("Failed to register instance {}: {}", id, e);
        }

        let outputs = self.engine.start();
        self.apply(outputs);
        self.spawn_announcer();

        loop {
            tokio::select! {
                frame = self.control.recv() => match frame {
                    Some(frame) => self.on_control_frame(&frame),
                    None => break,
                },
                frame = self.relay.recv() => match frame {
                    Some(frame) => self.on_relay_frame(&frame),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => match event {
                    Event::Shutdown => break,
                    event => self.on_event(event).await,
                },
                Some(event) = self.client_rx.recv() => self.on_client_event(event),
            }
        }

        self.stop().await;
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Timer(token) => {
                let outputs = self.engine.handle(Input::Timer(token), Instant::now());
                self.apply(outputs);
            }
            Event::Cleared => self.open_transport().await,
            Event::RecoveryDone(instance_id) => {
                self.recovering.remove(&instance_id);
            }
            Event::Shutdown => {}
        }
    }

    /// Executes engine outputs. Delivery counts of vote requests are fed
    /// straight back so the engine learns its voter count before any grant
    /// is processed.
    fn apply(&mut self, outputs: Vec<Output>) {
        let mut queue: VecDeque<Output> = outputs.into();
        while let Some(output) = queue.pop_front() {
            match output {
                Output::Publish(message) => {
                    let receivers = self.bus.publish_control(&message);
                    if let ControlMessage::VoteRequest { term, .. } = message {
                        queue.extend(
                            self.engine
                                .handle(Input::Delivered { term, receivers }, Instant::now()),
                        );
                    }
                }
                Output::Schedule { token, after } => self.schedule(token, after),
                Output::Cancel(kind) => {
                    if let Some(timer) = self.timers.remove(&kind) {
                        timer.abort();
                    }
                }
                Output::Transition { role, term, leader } => {
                    self.on_transition(role, term, leader)
                }
            }
        }
    }

    fn schedule(&mut self, token: TimerToken, after: Duration) {
        let events = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::Timer(token));
        });
        if let Some(previous) = self.timers.insert(token.kind, timer) {
            previous.abort();
        }
    }

    fn on_transition(&mut self, role: Role, term: Term, leader: Option<String>) {
        let was_leader = self.status.borrow().is_leader();
        if was_leader != (role == Role::Leader) {
            // Bins belong to one reign only
            self.arbiter.clear();
            self.recovering.clear();
        }
        if self.status.borrow().leader != leader {
            // Requests sent to a former leader may never be answered
            self.naming.clear();
        }
        match (&role, &leader) {
            (Role::Leader, _) => info!("{} is leader for term {}", self.id(), term),
            (Role::Candidate, _) => info!("{} standing for term {}", self.id(), term),
            (Role::Follower, Some(leader)) => {
                info!("{} follows {} in term {}", self.id(), leader, term)
            }
            (Role::Follower, None) => {
                debug!("{} follower without leader in term {}", self.id(), term)
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = InstanceStatus {
            instance_id: self.config.instance_id.clone(),
            role: self.engine.role(),
            term: self.engine.term(),
            leader: self.engine.leader().map(str::to_string),
            cleared: self.cleared,
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn on_control_frame(&mut self, frame: &str) {
        let message = match ControlMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping control frame: {}", e);
                return;
            }
        };

        match message {
            ControlMessage::InstanceUp { instance_id } => self.on_instance_up(instance_id),
            ControlMessage::ClearedToStart {
                leader_id,
                instance_id,
            } => {
                if instance_id == self.config.instance_id {
                    self.on_cleared_to_start(&leader_id);
                }
            }
            message => {
                let outputs = self.engine.handle(Input::Control(message), Instant::now());
                self.apply(outputs);
            }
        }
    }

    /// Leader side of crash recovery: tell everyone the restarted instance's
    /// former clients are gone, then let it start.
    fn on_instance_up(&mut self, instance_id: String) {
        if !self.is_leader() || !self.recovering.insert(instance_id.clone()) {
            return;
        }
        info!("Recovering instance {}", instance_id);

        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        let events = self.events_tx.clone();
        let leader_id = self.config.instance_id.clone();
        tokio::spawn(async move {
            match recovery_notices(&*registry, &instance_id).await {
                Ok(notices) => {
                    for notice in &notices {
                        bus.publish_relay(notice);
                    }
                    if !notices.is_empty() {
                        info!(
                            "Announced {} stale clients of {}",
                            notices.len(),
                            instance_id
                        );
                    }
                }
                Err(e) => warn!("Could not read registry of {}: {}", instance_id, e),
            }
            bus.publish_control(&ControlMessage::ClearedToStart {
                leader_id,
                instance_id: instance_id.clone(),
            });
            let _ = events.send(Event::RecoveryDone(instance_id));
        });
    }

    fn on_cleared_to_start(&mut self, leader_id: &str) {
        if self.cleared || self.clearing {
            return;
        }
        if self.engine.leader() != Some(leader_id) {
            // The real leader answers a later INSTANCE_UP
            debug!(
                "{} ignoring clearance from {}, leader is {:?}",
                self.id(),
                leader_id,
                self.engine.leader()
            );
            return;
        }
        self.clearing = true;
        info!("{} cleared to start by {}", self.id(), leader_id);

        let registry = Arc::clone(&self.registry);
        let events = self.events_tx.clone();
        let instance_id = self.config.instance_id.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.clear_clients(&instance_id).await {
                warn!("Failed to clear registry of {}: {}", instance_id, e);
            }
            let _ = events.send(Event::Cleared);
        });
    }

    async fn open_transport(&mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.abort();
        }
        match self.transport.open(self.client_tx.clone()).await {
            Ok(commands) => {
                self.commands = Some(commands);
                self.cleared = true;
                info!("{} accepting clients", self.id());
            }
            Err(e) => {
                error!("{} could not open client transport: {}", self.id(), e);
                self.cleared = true;
            }
        }
        self.publish_status();
    }

    /// Repeats `INSTANCE_UP` until cleared, so a request made while no
    /// leader existed is not lost.
    fn spawn_announcer(&mut self) {
        let bus = Arc::clone(&self.bus);
        let interval = self.config.announce_interval;
        let message = ControlMessage::InstanceUp {
            instance_id: self.config.instance_id.clone(),
        };
        self.announcer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                bus.publish_control(&message);
            }
        }));
    }

    fn on_relay_frame(&mut self, frame: &str) {
        let message = match RelayMessage::from_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping relay frame: {}", e);
                return;
            }
        };

        match message {
            RelayMessage::NameRequest {
                client_id,
                instance_id,
            } => {
                if self.is_leader() {
                    self.spawn_name_allocation(client_id, instance_id);
                }
            }
            RelayMessage::NameDecree { client_id, name } => self.on_name_decree(client_id, name),
            RelayMessage::MatchRequest {
                requester,
                preferences,
            } => {
                if !self.is_leader() {
                    return;
                }
                match self.arbiter.request_match(&requester, preferences) {
                    MatchOutcome::Matched {
                        requester,
                        opponent,
                        ..
                    } => {
                        self.bus
                            .publish_relay(&RelayMessage::MatchDecree { requester, opponent });
                    }
                    MatchOutcome::Waiting { bin } => {
                        if let Some(slot) = self.arbiter.waiting(bin) {
                            debug!(
                                "{} waits in bin {}, {} waiting in total",
                                slot.player,
                                bin,
                                self.arbiter.waiting_count()
                            );
                        }
                    }
                }
            }
            RelayMessage::MatchDecree {
                requester,
                opponent,
            } => {
                self.pair_local(&requester, &opponent);
                self.pair_local(&opponent, &requester);
            }
            RelayMessage::Data {
                source,
                target,
                payload,
            } => {
                if let Some(client_id) = self.roster.client_for_name(&target) {
                    let payload = match payload {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    let client_id = client_id.to_string();
                    self.send_to(&client_id, Packet::Relay { source, payload });
                }
            }
            RelayMessage::DisconnectNotice { source, opponent } => {
                if self.is_leader() && self.arbiter.scrub(&source) {
                    debug!("Removed {} from matchmaking", source);
                }
                if let Some(opponent) = opponent {
                    self.unpair_local(&opponent, &source);
                }
            }
        }
    }

    /// The first decree for a client wins. A name that ends up unused here
    /// is released again, since the leader recorded it under this instance.
    fn on_name_decree(&mut self, client_id: String, name: String) {
        let requested = self.naming.remove(&client_id);
        match self.roster.get(&client_id).map(|client| client.name.clone()) {
            Some(None) => {
                self.roster.assign_name(&client_id, &name);
                self.send_to(&client_id, Packet::NameAssigned { name });
            }
            Some(Some(current)) => {
                if current != name {
                    debug!("{} already named {}, releasing {}", client_id, current, name);
                    self.spawn_registry_removal(name);
                }
            }
            None => {
                if requested {
                    debug!("{} left before being named, releasing {}", client_id, name);
                    self.spawn_registry_removal(name);
                }
            }
        }
    }

    fn spawn_name_allocation(&self, client_id: String, instance_id: String) {
        let registry = Arc::clone(&self.registry);
        let bus = Arc::clone(&self.bus);
        let attempts = self.config.arbiter.name_attempts;
        tokio::spawn(async move {
            match allocate_name(&*registry, &instance_id, attempts, random_name).await {
                Ok(name) => {
                    info!("Named client {} on {}: {}", client_id, instance_id, name);
                    bus.publish_relay(&RelayMessage::NameDecree { client_id, name });
                }
                Err(e) => warn!("Name request for {} abandoned: {}", client_id, e),
            }
        });
    }

    /// Records a match for `local` if that client lives here.
    fn pair_local(&mut self, local: &str, opponent: &str) {
        let Some(client_id) = self.roster.set_opponent(local, Some(opponent)) else {
            return;
        };
        self.send_to(
            &client_id,
            Packet::Matched {
                opponent: opponent.to_string(),
            },
        );
        self.spawn_registry_write(local, Some(opponent));
    }

    /// Tells `local` its opponent `departed` left, if both still apply.
    fn unpair_local(&mut self, local: &str, departed: &str) {
        let Some(client_id) = self.roster.client_for_name(local).map(str::to_string) else {
            return;
        };
        if self.roster.opponent_of(&client_id) != Some(departed) {
            return;
        }
        self.roster.set_opponent(local, None);
        self.send_to(
            &client_id,
            Packet::OpponentLeft {
                name: departed.to_string(),
            },
        );
        self.spawn_registry_write(local, None);
    }

    fn spawn_registry_write(&self, name: &str, opponent: Option<&str>) {
        let registry = Arc::clone(&self.registry);
        let instance_id = self.config.instance_id.clone();
        let name = name.to_string();
        let opponent = opponent.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = registry
                .set_client(&instance_id, &name, opponent.as_deref())
                .await
            {
                warn!("Failed to record {} in registry: {}", name, e);
            }
        });
    }

    fn on_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { client_id } => self.roster.insert(&client_id),
            ClientEvent::RequestName { client_id } => {
                if self.roster.get(&client_id).is_none() {
                    return;
                }
                match self.roster.name_of(&client_id).map(str::to_string) {
                    Some(name) => self.send_to(&client_id, Packet::NameAssigned { name }),
                    None => {
                        if !self.naming.insert(client_id.clone()) {
                            debug!("Name request for {} already pending", client_id);
                            return;
                        }
                        self.bus.publish_relay(&RelayMessage::NameRequest {
                            client_id,
                            instance_id: self.config.instance_id.clone(),
                        });
                    }
                }
            }
            ClientEvent::FindMatch {
                client_id,
                preferences,
            } => match self.roster.name_of(&client_id) {
                Some(name) => {
                    self.bus.publish_relay(&RelayMessage::MatchRequest {
                        requester: name.to_string(),
                        preferences,
                    });
                }
                None => debug!("Client {} asked for a match without a name", client_id),
            },
            ClientEvent::Data { client_id, payload } => {
                let Some(client) = self.roster.get(&client_id) else {
                    return;
                };
                if let (Some(source), Some(target)) = (&client.name, &client.opponent) {
                    self.bus.publish_relay(&RelayMessage::Data {
                        source: source.clone(),
                        target: target.clone(),
                        payload: Value::String(payload),
                    });
                }
            }
            ClientEvent::Disconnected { client_id } => self.on_client_gone(&client_id),
        }
    }

    fn on_client_gone(&mut self, client_id: &str) {
        let Some(client) = self.roster.remove(client_id) else {
            return;
        };
        let Some(name) = client.name else {
            return;
        };
        self.bus.publish_relay(&RelayMessage::DisconnectNotice {
            source: name.clone(),
            opponent: client.opponent,
        });
        self.spawn_registry_removal(name);
    }

    fn spawn_registry_removal(&self, name: String) {
        let registry = Arc::clone(&self.registry);
        let instance_id = self.config.instance_id.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.remove_client(&instance_id, &name).await {
                warn!("Failed to remove {} from registry: {}", name, e);
            }
        });
    }

    fn send_to(&self, client_id: &str, packet: Packet) {
        let Some(commands) = &self.commands else {
            return;
        };
        if commands
            .send(ClientCommand::Send {
                client_id: client_id.to_string(),
                packet,
            })
            .is_err()
        {
            error!("Client transport of {} is gone", self.id());
        }
    }

    /// Graceful leave: release clients, tell their opponents, drop out of
    /// the live set.
    async fn stop(&mut self) {
        info!("Instance {} shutting down", self.id());
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if let Some(announcer) = self.announcer.take() {
            announcer.abort();
        }

        for client_id in self.roster.client_ids() {
            if let Some(client) = self.roster.remove(&client_id) {
                if let Some(name) = client.name {
                    self.bus.publish_relay(&RelayMessage::DisconnectNotice {
                        source: name,
                        opponent: client.opponent,
                    });
                }
            }
            if let Some(commands) = &self.commands {
                let _ = commands.send(ClientCommand::Close {
                    client_id,
                    reason: "Instance shutting down".to_string(),
                });
            }
        }

        let id = self.config.instance_id.clone();
        if let Err(e) = self.registry.clear_clients(&id).await {
            warn!("Failed to clear registry of {}: {}", id, e);
        }
        if let Err(e) = self.registry.remove_instance(&id).await {
            warn!("Failed to deregister {}: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::config::ElectionConfig;
    use crate::registry::InMemoryRegistry;
    use crate::transport::{ChannelTransport, ClientPort};
    use shared::MatchPreferences;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(id: &str) -> InstanceConfig {
        InstanceConfig {
            instance_id: id.to_string(),
            election: ElectionConfig::fast(),
            announce_interval: Duration::from_millis(50),
            ..InstanceConfig::default()
        }
    }

    struct Solo {
        handle: CoordinatorHandle,
        port: ClientPort,
        registry: Arc<InMemoryRegistry>,
        bus: Arc<InMemoryBus>,
    }

    async fn solo(id: &str) -> Solo {
        let bus = Arc::new(InMemoryBus::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let (transport, pending) = ChannelTransport::new();
        let (coordinator, mut handle) =
            Coordinator::new(config(id), bus.clone(), registry.clone(), Box::new(transport));
        tokio::spawn(coordinator.run());

        timeout(WAIT, handle.wait_for(|s| s.is_leader() && s.cleared))
            .await
            .unwrap()
            .unwrap();
        let port = timeout(WAIT, pending.opened()).await.unwrap().unwrap();
        Solo {
            handle,
            port,
            registry,
            bus,
        }
    }

    async fn named(port: &mut ClientPort, client_id: &str) -> String {
        port.connect(client_id);
        port.send(ClientEvent::RequestName {
            client_id: client_id.to_string(),
        });
        match timeout(WAIT, port.next_packet_for(client_id)).await.unwrap() {
            Some(Packet::NameAssigned { name }) => name,
            other => panic!("expected a name, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_single_instance_leads_and_clears_itself() {
        let solo = solo("i1").await;
        let status = solo.handle.status();
        assert_eq!(status.leader.as_deref(), Some("i1"));
        assert!(status.term >= 1);
        assert_eq!(solo.registry.instances().await.unwrap(), vec!["i1"]);
    }

    #[tokio::test]
    async fn test_name_request_assigns_and_records() {
        let mut solo = solo("i1").await;
        let name = named(&mut solo.port, "i1-1").await;

        let clients = solo.registry.clients("i1").await.unwrap();
        assert_eq!(clients.get(&name), Some(&None));

        // asking again returns the same name
        solo.port.send(ClientEvent::RequestName {
            client_id: "i1-1".to_string(),
        });
        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("i1-1")).await.unwrap(),
            Some(Packet::NameAssigned { name })
        );
    }

    #[tokio::test]
    async fn test_match_relay_and_disconnect() {
        let mut solo = solo("i1").await;
        let alice = named(&mut solo.port, "c1").await;
        let bob = named(&mut solo.port, "c2").await;

        solo.port.send(ClientEvent::FindMatch {
            client_id: "c1".to_string(),
            preferences: MatchPreferences {
                level: 2,
                allow_lower: true,
            },
        });
        solo.port.send(ClientEvent::FindMatch {
            client_id: "c2".to_string(),
            preferences: MatchPreferences {
                level: 0,
                allow_lower: false,
            },
        });

        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("c2")).await.unwrap(),
            Some(Packet::Matched {
                opponent: alice.clone()
            })
        );
        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("c1")).await.unwrap(),
            Some(Packet::Matched {
                opponent: bob.clone()
            })
        );

        solo.port.send(ClientEvent::Data {
            client_id: "c2".to_string(),
            payload: "stroke".to_string(),
        });
        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("c1")).await.unwrap(),
            Some(Packet::Relay {
                source: bob.clone(),
                payload: "stroke".to_string()
            })
        );

        solo.port.send(ClientEvent::Disconnected {
            client_id: "c2".to_string(),
        });
        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("c1")).await.unwrap(),
            Some(Packet::OpponentLeft { name: bob.clone() })
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let clients = solo.registry.clients("i1").await.unwrap();
        assert!(!clients.contains_key(&bob));
        assert_eq!(clients.get(&alice), Some(&None));
    }

    async fn registry_settles(registry: &InMemoryRegistry, expected: &[&str]) {
        timeout(WAIT, async {
            loop {
                let clients = registry.clients("i1").await.unwrap();
                let mut names: Vec<String> = clients.into_keys().collect();
                names.sort();
                if names == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_repeated_name_requests_leave_no_stray_names() {
        let mut solo = solo("i1").await;
        solo.port.connect("c1");
        for _ in 0..3 {
            solo.port.send(ClientEvent::RequestName {
                client_id: "c1".to_string(),
            });
        }
        let assigned = timeout(WAIT, solo.port.next_packet_for("c1")).await.unwrap();
        let name = match assigned {
            Some(Packet::NameAssigned { name }) => name,
            other => panic!("expected a name, got {:?}", other),
        };
        registry_settles(&solo.registry, &[name.as_str()]).await;

        solo.port.send(ClientEvent::Disconnected {
            client_id: "c1".to_string(),
        });
        registry_settles(&solo.registry, &[]).await;
    }

    #[tokio::test]
    async fn test_surplus_decree_is_released() {
        let mut solo = solo("i1").await;
        let name = named(&mut solo.port, "c1").await;

        // A second leader named the same client again
        solo.registry.set_client("i1", "Extra", None).await.unwrap();
        solo.bus.publish_relay(&RelayMessage::NameDecree {
            client_id: "c1".to_string(),
            name: "Extra".to_string(),
        });
        registry_settles(&solo.registry, &[name.as_str()]).await;

        solo.port.send(ClientEvent::RequestName {
            client_id: "c1".to_string(),
        });
        assert_eq!(
            timeout(WAIT, solo.port.next_packet_for("c1")).await.unwrap(),
            Some(Packet::NameAssigned { name })
        );
    }

    #[tokio::test]
    async fn test_name_for_departed_client_is_released() {
        let solo = solo("i1").await;
        solo.port.connect("c1");
        solo.port.send(ClientEvent::RequestName {
            client_id: "c1".to_string(),
        });
        solo.port.send(ClientEvent::Disconnected {
            client_id: "c1".to_string(),
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        registry_settles(&solo.registry, &[]).await;
    }

    #[tokio::test]
    async fn test_malformed_frames_are_ignored() {
        let solo = solo("i1").await;
        solo.bus.publish(Channel::Control, "not json".to_string());
        solo.bus.publish(Channel::Relay, r#"["MATCH_REQUEST","x",{"level":1}]"#.to_string());
        solo.bus.publish(Channel::Control, r#"["LEADER_CLAIM","x"]"#.to_string());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(solo.handle.is_leader());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_live_set() {
        let solo = solo("i1").await;
        solo.handle.shutdown();

        timeout(WAIT, async {
            while !solo.registry.instances().await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
