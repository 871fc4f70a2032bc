//! Coordination messages exchanged on the internal topic
//!
//! Every message is a JSON object tagged by `type` and carrying the `channel`
//! it was published on and the `source` host that sent it. Hosts listen on
//! the shared admin channel and on a channel named after their own host id.

use crate::assignments::{BucketAssignments, HostId};
use crate::error::{PoolingError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Broadcast channel every host listens on
pub const ADMIN_CHANNEL: &str = "admin";

/// Maximum encoded message size accepted from the bus (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of times a forwarded event may be re-published
pub const MAX_HOPS: u32 = 5;

/// Milliseconds since the Unix epoch
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Host liveness probe; also used by a starting host to check the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub channel: String,
    pub source: HostId,
    pub timestamp_ms: u64,
}

/// Request for every host to identify itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub channel: String,
    pub source: HostId,
}

/// A host announcing itself together with the table it currently holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub channel: String,
    pub source: HostId,
    pub assignments: Option<BucketAssignments>,
}

/// Leader announcement carrying the authoritative table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leader {
    pub channel: String,
    pub source: HostId,
    pub assignments: BucketAssignments,
}

/// A host leaving the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Offline {
    pub channel: String,
    pub source: HostId,
}

/// An external event handed to the host that owns its bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forward {
    pub channel: String,
    pub source: HostId,
    pub request_id: String,
    pub num_hops: u32,
    pub create_time_ms: u64,
    pub protocol: String,
    pub topic: String,
    pub payload: String,
}

impl Forward {
    pub fn new(
        source: impl Into<HostId>,
        request_id: impl Into<String>,
        protocol: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<String>,
        create_time_ms: u64,
    ) -> Self {
        Self {
            channel: String::new(),
            source: source.into(),
            request_id: request_id.into(),
            num_hops: 0,
            create_time_ms,
            protocol: protocol.into(),
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Count one more hop
    pub fn bump_hops(&mut self) {
        self.num_hops = self.num_hops.saturating_add(1);
    }

    /// True once the envelope has travelled further than allowed
    pub fn exceeds_hops(&self) -> bool {
        self.num_hops > MAX_HOPS
    }
}

/// Message discriminant, used for logging and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Query,
    Identification,
    Leader,
    Offline,
    Forward,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Query => "query",
            MessageKind::Identification => "identification",
            MessageKind::Leader => "leader",
            MessageKind::Offline => "offline",
            MessageKind::Forward => "forward",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "heartbeat" => MessageKind::Heartbeat,
            "query" => MessageKind::Query,
            "identification" => MessageKind::Identification,
            "leader" => MessageKind::Leader,
            "offline" => MessageKind::Offline,
            "forward" => MessageKind::Forward,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordination message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Heartbeat(Heartbeat),
    Query(Query),
    Identification(Identification),
    Leader(Leader),
    Offline(Offline),
    Forward(Forward),
}

impl Message {
    pub fn heartbeat(
        source: impl Into<HostId>,
        channel: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Message::Heartbeat(Heartbeat {
            channel: channel.into(),
            source: source.into(),
            timestamp_ms,
        })
    }

    pub fn query(source: impl Into<HostId>) -> Self {
        Message::Query(Query {
            channel: ADMIN_CHANNEL.to_string(),
            source: source.into(),
        })
    }

    pub fn identification(
        source: impl Into<HostId>,
        assignments: Option<BucketAssignments>,
    ) -> Self {
        Message::Identification(Identification {
            channel: ADMIN_CHANNEL.to_string(),
            source: source.into(),
            assignments,
        })
    }

    pub fn leader(source: impl Into<HostId>, assignments: BucketAssignments) -> Self {
        Message::Leader(Leader {
            channel: ADMIN_CHANNEL.to_string(),
            source: source.into(),
            assignments,
        })
    }

    pub fn offline(source: impl Into<HostId>) -> Self {
        Message::Offline(Offline {
            channel: ADMIN_CHANNEL.to_string(),
            source: source.into(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::Query(_) => MessageKind::Query,
            Message::Identification(_) => MessageKind::Identification,
            Message::Leader(_) => MessageKind::Leader,
            Message::Offline(_) => MessageKind::Offline,
            Message::Forward(_) => MessageKind::Forward,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            Message::Heartbeat(m) => &m.channel,
            Message::Query(m) => &m.channel,
            Message::Identification(m) => &m.channel,
            Message::Leader(m) => &m.channel,
            Message::Offline(m) => &m.channel,
            Message::Forward(m) => &m.channel,
        }
    }

    pub fn set_channel(&mut self, channel: impl Into<String>) {
        let channel = channel.into();
        match self {
            Message::Heartbeat(m) => m.channel = channel,
            Message::Query(m) => m.channel = channel,
            Message::Identification(m) => m.channel = channel,
            Message::Leader(m) => m.channel = channel,
            Message::Offline(m) => m.channel = channel,
            Message::Forward(m) => m.channel = channel,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Message::Heartbeat(m) => &m.source,
            Message::Query(m) => &m.source,
            Message::Identification(m) => &m.source,
            Message::Leader(m) => &m.source,
            Message::Offline(m) => &m.source,
            Message::Forward(m) => &m.source,
        }
    }

    /// Check the fields a receiver relies on.
    ///
    /// A message that fails here is never applied to any state.
    pub fn check_validity(&self) -> Result<()> {
        if self.source().is_empty() {
            return Err(invalid(self.kind(), "missing source"));
        }
        if self.channel().is_empty() {
            return Err(invalid(self.kind(), "missing channel"));
        }

        match self {
            Message::Leader(leader) => {
                if leader.assignments.is_empty() {
                    return Err(invalid(self.kind(), "empty assignments"));
                }
                if !leader.assignments.is_fully_assigned() {
                    return Err(invalid(self.kind(), "assignments contain unassigned buckets"));
                }
            }
            Message::Forward(forward) => {
                if forward.request_id.is_empty() {
                    return Err(invalid(self.kind(), "missing request id"));
                }
                if forward.protocol.is_empty() {
                    return Err(invalid(self.kind(), "missing protocol"));
                }
                if forward.topic.is_empty() {
                    return Err(invalid(self.kind(), "missing topic"));
                }
            }
            Message::Heartbeat(_)
            | Message::Query(_)
            | Message::Identification(_)
            | Message::Offline(_) => {}
        }

        Ok(())
    }
}

fn invalid(kind: MessageKind, reason: &str) -> PoolingError {
    PoolingError::InvalidMessage(format!("{}: {}", kind, reason))
}

/// Encode a message to its JSON wire form
pub fn encode(message: &Message) -> Result<String> {
    serde_json::to_string(message).map_err(|e| PoolingError::Serialization(e.to_string()))
}

/// Decode a message from its JSON wire form and validate it
pub fn decode(text: &str) -> Result<Message> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(PoolingError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| PoolingError::Deserialization(e.to_string()))?;

    match value.get("type") {
        None | Some(serde_json::Value::Null) => {
            return Err(PoolingError::InvalidMessage("missing type".into()))
        }
        Some(serde_json::Value::String(tag)) if MessageKind::from_tag(tag).is_some() => {}
        Some(other) => return Err(PoolingError::UnknownMessageType(other.to_string())),
    }

    let message: Message =
        serde_json::from_value(value).map_err(|e| PoolingError::Deserialization(e.to_string()))?;
    message.check_validity()?;
    Ok(message)
}
