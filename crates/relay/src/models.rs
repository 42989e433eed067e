use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::RelayError;

/// Group identifiers carry this prefix; everything else is a user id.
pub const GROUP_ID_PREFIX: char = 'G';

pub fn is_group_id(id: &str) -> bool {
    id.starts_with(GROUP_ID_PREFIX)
}

/// Kind of payload carried in `content`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Voice,
    File,
    /// Audio/video call signalling
    Av,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Voice => "voice",
            ContentType::File => "file",
            ContentType::Av => "av",
        }
    }
}

impl FromStr for ContentType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(ContentType::Text),
            "voice" => Ok(ContentType::Voice),
            "file" => Ok(ContentType::File),
            "av" => Ok(ContentType::Av),
            other => Err(RelayError::Protocol(format!("unknown content type {other}"))),
        }
    }
}

/// One inbound frame as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub sender: String,
    pub recipient: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Delivery status of an envelope. Transitions only move forward:
/// `Pending -> Sent -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn rank(&self) -> i64 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Failed => 2,
        }
    }

    /// True when moving from `current` to `self` is a forward transition.
    pub fn supersedes(&self, current: DeliveryStatus) -> bool {
        self.rank() > current.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(RelayError::Protocol(format!("unknown status {other}"))),
        }
    }
}

/// A routed chat message, owned by the hub from creation until persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Envelope {
    pub fn new_id() -> String {
        format!("M{}", Uuid::new_v4().simple())
    }

    /// Stamp a request with a fresh id and timestamp.
    pub fn from_request(request: ChatRequest) -> Self {
        Self {
            id: Self::new_id(),
            sender: request.sender,
            recipient: request.recipient,
            content: request.content,
            content_type: request.content_type,
            metadata: request.metadata,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn is_group(&self) -> bool {
        is_group_id(&self.recipient)
    }

    pub fn to_frame(&self) -> OutboundFrame {
        OutboundFrame {
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            content: self.content.clone(),
            content_type: self.content_type,
            created_at: self.created_at,
        }
    }
}

/// What a client receives for each delivered envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub content_type: ContentType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Login,
    Logout,
}

/// Login/logout record published on the distributed backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub client_id: String,
    pub node_id: String,
    /// The connection session the record belongs to
    #[serde(default)]
    pub session_id: Uuid,
    pub kind: PresenceKind,
    pub at: DateTime<Utc>,
}

impl PresenceEvent {
    pub fn login(
        client_id: impl Into<String>,
        node_id: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        Self::new(client_id, node_id, session_id, PresenceKind::Login)
    }

    pub fn logout(
        client_id: impl Into<String>,
        node_id: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        Self::new(client_id, node_id, session_id, PresenceKind::Logout)
    }

    fn new(
        client_id: impl Into<String>,
        node_id: impl Into<String>,
        session_id: Uuid,
        kind: PresenceKind,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            node_id: node_id.into(),
            session_id,
            kind,
            at: Utc::now(),
        }
    }
}
