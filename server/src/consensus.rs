//! Leader election over the control channel.
//!
//! A simplified Raft election without a replicated log. Each instance runs
//! one [`Engine`]; the engine never touches the bus or the clock itself.
//! The coordinator feeds it [`Input`]s (decoded control messages, delivery
//! counts, fired timers) together with the current instant, and executes the
//! [`Output`]s it returns: frames to publish and timers to arm or cancel.
//!
//! Timers carry a generation number. Arming a timer supersedes any earlier
//! token of the same kind, and leaving a state cancels the timers it owns,
//! so a token that fires late is recognized as stale and ignored.
//!
//! ```text
//!            timeout                      majority / no peers
//! Follower ───────────▶ Candidate ───────────────────────────▶ Leader
//!    ▲                   │  ▲  │ timeout (term + 1)              │
//!    │   claim >= term   │  └──┘                                 │
//!    ├───────────────────┘                                       │
//!    └───────────────────── claim > term ────────────────────────┘
//! ```

use crate::config::ElectionConfig;
use crate::failure_detector::{HeartbeatStats, PhiDetector};
use log::{debug, info};
use shared::{ControlMessage, Term};
use std::collections::HashSet;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

/// Identifies one armed timer. Only the most recently armed token of each
/// kind is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub enum Input {
    Control(ControlMessage),
    /// Number of subscribers a published vote request reached.
    Delivered { term: Term, receivers: usize },
    Timer(TimerToken),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Publish(ControlMessage),
    Schedule { token: TimerToken, after: Duration },
    Cancel(TimerKind),
    /// Role or recognized leader changed.
    Transition {
        role: Role,
        term: Term,
        leader: Option<String>,
    },
}

/// A leader claim is current if it is not from an older term.
pub fn claim_is_current(own_term: Term, claim_term: Term) -> bool {
    claim_term >= own_term
}

/// A sitting leader yields only to a strictly newer term.
pub fn claim_preempts_leader(own_term: Term, claim_term: Term) -> bool {
    claim_term > own_term
}

/// Newer terms always win a vote; the current term is first come, first served.
pub fn may_grant_vote(own_term: Term, voted: bool, request_term: Term) -> bool {
    request_term > own_term || (request_term == own_term && !voted)
}

/// `voters == 0` means the delivery count is not known yet.
pub fn has_majority(votes: usize, voters: usize) -> bool {
    voters > 0 && votes > voters / 2
}

/// Election state machine of one instance.
pub struct Engine {
    id: String,
    config: ElectionConfig,
    phi: Option<PhiDetector>,
    role: Role,
    term: Term,
    leader: Option<String>,
    voted: bool,
    votes: HashSet<String>,
    voters: usize,
    heartbeats: HeartbeatStats,
    next_generation: u64,
    election_timer: Option<u64>,
    heartbeat_timer: Option<u64>,
}

impl Engine {
    pub fn new(id: impl Into<String>, config: ElectionConfig) -> Self {
        let phi = config.phi_threshold.map(PhiDetector::new);
        Self {
            id: id.into(),
            config,
            phi,
            role: Role::Follower,
            term: 0,
            leader: None,
            voted: false,
            votes: HashSet::new(),
            voters: 0,
            heartbeats: HeartbeatStats::new(),
            next_generation: 0,
            election_timer: None,
            heartbeat_timer: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn has_voted(&self) -> bool {
        self.voted
    }

    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    pub fn voters(&self) -> usize {
        self.voters
    }

    pub fn heartbeats(&self) -> &HeartbeatStats {
        &self.heartbeats
    }

    /// Arms the first election timer.
    pub fn start(&mut self) -> Vec<Output> {
        let mut out = Vec::new();
        self.arm(TimerKind::Election, &mut out);
        out
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Output> {
        let mut out = Vec::new();
        match input {
            Input::Control(message) => self.on_control(message, now, &mut out),
            Input::Delivered { term, receivers } => self.on_delivered(term, receivers, &mut out),
            Input::Timer(token) => self.on_timer(token, now, &mut out),
        }
        out
    }

    fn on_control(&mut self, message: ControlMessage, now: Instant, out: &mut Vec<Output>) {
        match message {
            ControlMessage::LeaderClaim { instance_id, term } => {
                if instance_id != self.id {
                    self.on_leader_claim(instance_id, term, now, out);
                }
            }
            ControlMessage::VoteRequest { instance_id, term } => {
                if instance_id != self.id {
                    self.on_vote_request(instance_id, term, out);
                }
            }
            ControlMessage::VoteGrant {
                instance_id,
                term,
                for_instance_id,
            } => self.on_vote_grant(instance_id, term, &for_instance_id, out),
            ControlMessage::InstanceUp { .. } | ControlMessage::ClearedToStart { .. } => {}
        }
    }

    fn on_leader_claim(
        &mut self,
        claimant: String,
        term: Term,
        now: Instant,
        out: &mut Vec<Output>,
    ) {
        let adopt = match self.role {
            Role::Leader => claim_preempts_leader(self.term, term),
            Role::Candidate | Role::Follower => claim_is_current(self.term, term),
        };
        if !adopt {
            debug!(
                "[{}] ignoring claim from {} for term {} (own term {}, {:?})",
                self.id, claimant, term, self.term, self.role
            );
            return;
        }

        if self.role == Role::Follower && self.leader.as_deref() == Some(claimant.as_str()) {
            self.advance_term(term);
            self.heartbeats.record(now);
            self.arm(TimerKind::Election, out);
            return;
        }

        self.follow(claimant, term, now, out);
    }

    fn on_vote_request(&mut self, candidate: String, term: Term, out: &mut Vec<Output>) {
        if self.role == Role::Leader {
            debug!(
                "[{}] leader ignoring vote request from {} for term {}",
                self.id, candidate, term
            );
            return;
        }
        if !may_grant_vote(self.term, self.voted, term) {
            debug!(
                "[{}] refusing vote to {} for term {} (own term {}, voted {})",
                self.id, candidate, term, self.term, self.voted
            );
            return;
        }

        if term > self.term {
            self.advance_term(term);
            let lost_leader = self.leader.take().is_some();
            if lost_leader {
                self.heartbeats.reset();
            }
            let was_candidate = self.role == Role::Candidate;
            if was_candidate {
                self.role = Role::Follower;
                self.votes.clear();
                self.voters = 0;
            }
            if lost_leader || was_candidate {
                self.emit_transition(out);
            }
        }

        self.voted = true;
        info!("[{}] voting for {} in term {}", self.id, candidate, term);
        out.push(Output::Publish(ControlMessage::VoteGrant {
            instance_id: self.id.clone(),
            term,
            for_instance_id: candidate,
        }));
        self.arm(TimerKind::Election, out);
    }

    fn on_vote_grant(&mut self, voter: String, term: Term, candidate: &str, out: &mut Vec<Output>) {
        if self.role != Role::Candidate || term != self.term || candidate != self.id {
            return;
        }
        if !self.votes.insert(voter) {
            return;
        }
        debug!(
            "[{}] {} of {} votes in term {}",
            self.id,
            self.votes.len(),
            self.voters,
            self.term
        );
        if has_majority(self.votes.len(), self.voters) {
            self.become_leader(out);
        }
    }

    fn on_delivered(&mut self, term: Term, receivers: usize, out: &mut Vec<Output>) {
        if self.role != Role::Candidate || term != self.term {
            return;
        }
        self.voters = receivers;
        if receivers <= 1 {
            info!("[{}] no peers observed, promoting self", self.id);
            self.become_leader(out);
        } else if has_majority(self.votes.len(), self.voters) {
            self.become_leader(out);
        }
    }

    fn on_timer(&mut self, token: TimerToken, now: Instant, out: &mut Vec<Output>) {
        match token.kind {
            TimerKind::Election => {
                if self.election_timer != Some(token.generation) {
                    debug!("[{}] stale election timer", self.id);
                    return;
                }
                self.election_timer = None;
                match self.role {
                    Role::Follower => {
                        if let (Some(detector), Some(leader)) = (self.phi, self.leader.as_deref()) {
                            if !detector.is_suspect(&self.heartbeats, now) {
                                debug!(
                                    "[{}] leader {} late but phi {:.2} below threshold",
                                    self.id,
                                    leader,
                                    self.heartbeats.phi(now)
                                );
                                self.arm(TimerKind::Election, out);
                                return;
                            }
                        }
                        self.start_candidacy(out);
                    }
                    Role::Candidate => {
                        info!("[{}] election for term {} timed out", self.id, self.term);
                        self.start_candidacy(out);
                    }
                    Role::Leader => {}
                }
            }
            TimerKind::Heartbeat => {
                if self.heartbeat_timer != Some(token.generation) || self.role != Role::Leader {
                    debug!("[{}] stale heartbeat timer", self.id);
                    return;
                }
                self.heartbeat_timer = None;
                out.push(Output::Publish(self.leader_claim()));
                self.arm(TimerKind::Heartbeat, out);
            }
        }
    }

    fn start_candidacy(&mut self, out: &mut Vec<Output>) {
        self.role = Role::Candidate;
        self.term += 1;
        self.leader = None;
        self.heartbeats.reset();
        self.voted = true;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.voters = 0;
        info!("[{}] starting election for term {}", self.id, self.term);

        self.emit_transition(out);
        self.arm(TimerKind::Election, out);
        out.push(Output::Publish(ControlMessage::VoteRequest {
            instance_id: self.id.clone(),
            term: self.term,
        }));
    }

    fn become_leader(&mut self, out: &mut Vec<Output>) {
        self.role = Role::Leader;
        self.leader = Some(self.id.clone());
        self.heartbeats.reset();
        info!(
            "[{}] elected leader for term {} ({} of {} votes)",
            self.id,
            self.term,
            self.votes.len(),
            self.voters
        );

        self.cancel(TimerKind::Election, out);
        self.emit_transition(out);
        out.push(Output::Publish(self.leader_claim()));
        self.arm(TimerKind::Heartbeat, out);
    }

    fn follow(&mut self, leader: String, term: Term, now: Instant, out: &mut Vec<Output>) {
        if self.role == Role::Leader {
            info!(
                "[{}] stepping down, {} leads term {}",
                self.id, leader, term
            );
        } else {
            info!("[{}] following {} in term {}", self.id, leader, term);
        }
        self.advance_term(term);
        self.role = Role::Follower;
        self.votes.clear();
        self.voters = 0;
        self.leader = Some(leader);
        self.heartbeats.reset();
        self.heartbeats.record(now);

        self.cancel(TimerKind::Heartbeat, out);
        self.emit_transition(out);
        self.arm(TimerKind::Election, out);
    }

    /// Moves to a newer term, which always starts with no vote cast.
    fn advance_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.voted = false;
        }
    }

    fn leader_claim(&self) -> ControlMessage {
        ControlMessage::LeaderClaim {
            instance_id: self.id.clone(),
            term: self.term,
        }
    }

    fn emit_transition(&self, out: &mut Vec<Output>) {
        out.push(Output::Transition {
            role: self.role,
            term: self.term,
            leader: self.leader.clone(),
        });
    }

    fn arm(&mut self, kind: TimerKind, out: &mut Vec<Output>) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let after = match kind {
            TimerKind::Election => {
                self.election_timer = Some(generation);
                self.config.random_election_timeout()
            }
            TimerKind::Heartbeat => {
                self.heartbeat_timer = Some(generation);
                self.config.heartbeat_interval
            }
        };
        out.push(Output::Schedule {
            token: TimerToken { kind, generation },
            after,
        });
    }

    fn cancel(&mut self, kind: TimerKind, out: &mut Vec<Output>) {
        let slot = match kind {
            TimerKind::Election => &mut self.election_timer,
            TimerKind::Heartbeat => &mut self.heartbeat_timer,
        };
        if slot.take().is_some() {
            out.push(Output::Cancel(kind));
        }
    }
}
