//! Wire protocol shared by coordinator instances and their clients.
//!
//! Two formats live here:
//!
//! - **Bus frames**: JSON tagged tuples (`["LEADER_CLAIM", "a1b2", 7]`) carried
//!   on the control and client-relay channels between instances. Every frame
//!   passes [`validate_frame`] before it is decoded, so a peer sending junk
//!   can never push a half-built message into the coordinator.
//! - **Client packets**: [`Packet`], bincode-encoded datagrams exchanged
//!   between an instance and its locally connected clients.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Election epoch number.
pub type Term = u64;

/// Client protocol version accepted by the server.
pub const PROTOCOL_VERSION: u32 = 1;

/// Logical bus channel a frame travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Election, heartbeat and lifecycle traffic.
    Control,
    /// Client-facing events relayed between instances.
    Relay,
}

/// Reasons a bus frame is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(String),

    #[error("frame is not a tagged tuple")]
    NotATuple,

    #[error("unknown message type {tag:?} on {channel:?} channel")]
    UnknownType { tag: String, channel: Channel },

    #[error("{tag} expects {expected} fields, got {actual}")]
    FieldCount {
        tag: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{tag} field {index} must be {expected}")]
    FieldType {
        tag: &'static str,
        index: usize,
        expected: &'static str,
    },

    #[error("{tag} payload is missing `{field}`")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    Term,
    TextOrNull,
    MatchPayload,
    Any,
}

impl FieldKind {
    fn describe(self) -> &'static str {
        match self {
            FieldKind::Text => "a string",
            FieldKind::Term => "a non-negative integer",
            FieldKind::TextOrNull => "a string or null",
            FieldKind::MatchPayload => "an object",
            FieldKind::Any => "present",
        }
    }
}

type Schema = (&'static str, &'static [FieldKind]);

const CONTROL_SCHEMAS: &[Schema] = &[
    ("LEADER_CLAIM", &[FieldKind::Text, FieldKind::Term]),
    ("VOTE_REQUEST", &[FieldKind::Text, FieldKind::Term]),
    (
        "VOTE_GRANT",
        &[FieldKind::Text, FieldKind::Term, FieldKind::Text],
    ),
    ("INSTANCE_UP", &[FieldKind::Text]),
    ("CLEARED_TO_START", &[FieldKind::Text, FieldKind::Text]),
];

const RELAY_SCHEMAS: &[Schema] = &[
    ("NAME_REQUEST", &[FieldKind::Text, FieldKind::Text]),
    ("NAME_DECREE", &[FieldKind::Text, FieldKind::Text]),
    ("MATCH_REQUEST", &[FieldKind::Text, FieldKind::MatchPayload]),
    ("MATCH_DECREE", &[FieldKind::Text, FieldKind::Text]),
    ("DATA", &[FieldKind::Text, FieldKind::Text, FieldKind::Any]),
    ("DISCONNECT_NOTICE", &[FieldKind::Text, FieldKind::TextOrNull]),
];

/// Checks a decoded frame against the schema of its type tag.
///
/// Returns the canonical tag on success. Field indexes in errors count the
/// tag as field 0.
pub fn validate_frame(frame: &Value, channel: Channel) -> Result<&'static str, ProtocolError> {
    let fields = frame.as_array().ok_or(ProtocolError::NotATuple)?;
    let tag = fields
        .first()
        .and_then(Value::as_str)
        .ok_or(ProtocolError::NotATuple)?;

    let schemas = match channel {
        Channel::Control => CONTROL_SCHEMAS,
        Channel::Relay => RELAY_SCHEMAS,
    };
    let (tag, kinds) = schemas
        .iter()
        .find(|(name, _)| *name == tag)
        .copied()
        .ok_or_else(|| ProtocolError::UnknownType {
            tag: tag.to_string(),
            channel,
        })?;

    if fields.len() - 1 != kinds.len() {
        return Err(ProtocolError::FieldCount {
            tag,
            expected: kinds.len(),
            actual: fields.len() - 1,
        });
    }

    for (offset, (kind, value)) in kinds.iter().zip(&fields[1..]).enumerate() {
        let index = offset + 1;
        let ok = match kind {
            FieldKind::Text => value.is_string(),
            FieldKind::Term => value.is_u64(),
            FieldKind::TextOrNull => value.is_string() || value.is_null(),
            FieldKind::Any => true,
            FieldKind::MatchPayload => {
                let payload = value.as_object().ok_or(ProtocolError::FieldType {
                    tag,
                    index,
                    expected: kind.describe(),
                })?;
                if !payload.get("level").map_or(false, Value::is_i64) {
                    return Err(ProtocolError::MissingField {
                        tag,
                        field: "level",
                    });
                }
                if !payload.get("allowLower").map_or(false, Value::is_boolean) {
                    return Err(ProtocolError::MissingField {
                        tag,
                        field: "allowLower",
                    });
                }
                true
            }
        };
        if !ok {
            return Err(ProtocolError::FieldType {
                tag,
                index,
                expected: kind.describe(),
            });
        }
    }

    Ok(tag)
}

fn parse_frame(frame: &str, channel: Channel) -> Result<(&'static str, Vec<Value>), ProtocolError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let tag = validate_frame(&value, channel)?;
    match value {
        Value::Array(fields) => Ok((tag, fields)),
        _ => Err(ProtocolError::NotATuple),
    }
}

fn text(fields: &[Value], tag: &'static str, index: usize) -> Result<String, ProtocolError> {
    fields
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::FieldType {
            tag,
            index,
            expected: FieldKind::Text.describe(),
        })
}

fn term(fields: &[Value], tag: &'static str, index: usize) -> Result<Term, ProtocolError> {
    fields
        .get(index)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::FieldType {
            tag,
            index,
            expected: FieldKind::Term.describe(),
        })
}

/// Messages on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    LeaderClaim {
        instance_id: String,
        term: Term,
    },
    VoteRequest {
        instance_id: String,
        term: Term,
    },
    VoteGrant {
        instance_id: String,
        term: Term,
        for_instance_id: String,
    },
    InstanceUp {
        instance_id: String,
    },
    ClearedToStart {
        leader_id: String,
        instance_id: String,
    },
}

impl ControlMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::LeaderClaim { .. } => "LEADER_CLAIM",
            ControlMessage::VoteRequest { .. } => "VOTE_REQUEST",
            ControlMessage::VoteGrant { .. } => "VOTE_GRANT",
            ControlMessage::InstanceUp { .. } => "INSTANCE_UP",
            ControlMessage::ClearedToStart { .. } => "CLEARED_TO_START",
        }
    }

    pub fn to_value(&self) -> Value {
        let tag = self.tag();
        match self {
            ControlMessage::LeaderClaim { instance_id, term }
            | ControlMessage::VoteRequest { instance_id, term } => json!([tag, instance_id, term]),
            ControlMessage::VoteGrant {
                instance_id,
                term,
                for_instance_id,
            } => json!([tag, instance_id, term, for_instance_id]),
            ControlMessage::InstanceUp { instance_id } => json!([tag, instance_id]),
            ControlMessage::ClearedToStart {
                leader_id,
                instance_id,
            } => json!([tag, leader_id, instance_id]),
        }
    }

    pub fn to_frame(&self) -> String {
        self.to_value().to_string()
    }

    /// Parses and validates a control-channel frame.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        let (tag, fields) = parse_frame(frame, Channel::Control)?;
        let message = match tag {
            "LEADER_CLAIM" => ControlMessage::LeaderClaim {
                instance_id: text(&fields, tag, 1)?,
                term: term(&fields, tag, 2)?,
            },
            "VOTE_REQUEST" => ControlMessage::VoteRequest {
                instance_id: text(&fields, tag, 1)?,
                term: term(&fields, tag, 2)?,
            },
            "VOTE_GRANT" => ControlMessage::VoteGrant {
                instance_id: text(&fields, tag, 1)?,
                term: term(&fields, tag, 2)?,
                for_instance_id: text(&fields, tag, 3)?,
            },
            "INSTANCE_UP" => ControlMessage::InstanceUp {
                instance_id: text(&fields, tag, 1)?,
            },
            _ => ControlMessage::ClearedToStart {
                leader_id: text(&fields, tag, 1)?,
                instance_id: text(&fields, tag, 2)?,
            },
        };
        Ok(message)
    }
}

/// Matchmaking preferences carried by a match request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPreferences {
    pub level: i64,
    pub allow_lower: bool,
}

/// Messages on the client-relay channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    NameRequest {
        client_id: String,
        instance_id: String,
    },
    NameDecree {
        client_id: String,
        name: String,
    },
    MatchRequest {
        requester: String,
        preferences: MatchPreferences,
    },
    MatchDecree {
        requester: String,
        opponent: String,
    },
    Data {
        source: String,
        target: String,
        payload: Value,
    },
    DisconnectNotice {
        source: String,
        opponent: Option<String>,
    },
}

impl RelayMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            RelayMessage::NameRequest { .. } => "NAME_REQUEST",
            RelayMessage::NameDecree { .. } => "NAME_DECREE",
            RelayMessage::MatchRequest { .. } => "MATCH_REQUEST",
            RelayMessage::MatchDecree { .. } => "MATCH_DECREE",
            RelayMessage::Data { .. } => "DATA",
            RelayMessage::DisconnectNotice { .. } => "DISCONNECT_NOTICE",
        }
    }

    pub fn to_value(&self) -> Value {
        let tag = self.tag();
        match self {
            RelayMessage::NameRequest {
                client_id,
                instance_id,
            } => json!([tag, client_id, instance_id]),
            RelayMessage::NameDecree { client_id, name } => json!([tag, client_id, name]),
            RelayMessage::MatchRequest {
                requester,
                preferences,
            } => json!([
                tag,
                requester,
                { "level": preferences.level, "allowLower": preferences.allow_lower }
            ]),
            RelayMessage::MatchDecree {
                requester,
                opponent,
            } => json!([tag, requester, opponent]),
            RelayMessage::Data {
                source,
                target,
                payload,
            } => json!([tag, source, target, payload]),
            RelayMessage::DisconnectNotice { source, opponent } => json!([tag, source, opponent]),
        }
    }

    pub fn to_frame(&self) -> String {
        self.to_value().to_string()
    }

    /// Parses and validates a relay-channel frame.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        let (tag, mut fields) = parse_frame(frame, Channel::Relay)?;
        let message = match tag {
            "NAME_REQUEST" => RelayMessage::NameRequest {
                client_id: text(&fields, tag, 1)?,
                instance_id: text(&fields, tag, 2)?,
            },
            "NAME_DECREE" => RelayMessage::NameDecree {
                client_id: text(&fields, tag, 1)?,
                name: text(&fields, tag, 2)?,
            },
            "MATCH_REQUEST" => {
                let preferences = serde_json::from_value(fields[2].take()).map_err(|_| {
                    ProtocolError::FieldType {
                        tag,
                        index: 2,
                        expected: FieldKind::MatchPayload.describe(),
                    }
                })?;
                RelayMessage::MatchRequest {
                    requester: text(&fields, tag, 1)?,
                    preferences,
                }
            }
            "MATCH_DECREE" => RelayMessage::MatchDecree {
                requester: text(&fields, tag, 1)?,
                opponent: text(&fields, tag, 2)?,
            },
            "DATA" => RelayMessage::Data {
                source: text(&fields, tag, 1)?,
                target: text(&fields, tag, 2)?,
                payload: fields[3].take(),
            },
            _ => RelayMessage::DisconnectNotice {
                source: text(&fields, tag, 1)?,
                opponent: fields[2].as_str().map(str::to_string),
            },
        };
        Ok(message)
    }
}

/// Datagrams exchanged between an instance and a connected client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    RequestName,
    FindMatch {
        level: i64,
        allow_lower: bool,
    },
    /// Opaque payload for the current opponent.
    Data {
        payload: String,
    },
    Heartbeat,
    Disconnect,

    Connected {
        client_id: String,
    },
    NameAssigned {
        name: String,
    },
    Matched {
        opponent: String,
    },
    Relay {
        source: String,
        payload: String,
    },
    OpponentLeft {
        name: String,
    },
    Disconnected {
        reason: String,
    },
}
