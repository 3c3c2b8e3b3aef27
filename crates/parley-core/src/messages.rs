use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;
use crate::ids::{GroupId, MessageId, UserId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    Voice,
    Video,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Delivery status. Advances `sent -> delivered -> read`; `failed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Sent => 0,
            Self::Delivered => 1,
            Self::Read => 2,
            Self::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (Self::Read, Self::Failed) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Where a message goes. A message has exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Recipient {
    User(UserId),
    Group(GroupId),
}

impl Recipient {
    /// Build from the optional wire fields, treating empty strings as absent.
    pub fn from_parts(
        receiver_id: Option<UserId>,
        group_id: Option<GroupId>,
    ) -> Result<Self, ProtocolError> {
        let receiver_id = receiver_id.filter(|id| !id.is_empty());
        let group_id = group_id.filter(|id| !id.is_empty());
        match (receiver_id, group_id) {
            (Some(user), None) => Ok(Self::User(user)),
            (None, Some(group)) => Ok(Self::Group(group)),
            (None, None) => Err(ProtocolError::MissingRecipient),
            (Some(_), Some(_)) => Err(ProtocolError::AmbiguousRecipient),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient: Recipient,
    pub kind: MessageType,
    pub content: String,
    pub status: MessageStatus,
    /// Unix seconds.
    pub timestamp: i64,
}

impl Message {
    pub fn new(
        id: MessageId,
        sender_id: UserId,
        recipient: Recipient,
        kind: MessageType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sender_id,
            recipient,
            kind,
            content: content.into(),
            status: MessageStatus::Sent,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn receiver_id(&self) -> Option<&UserId> {
        match &self.recipient {
            Recipient::User(user) => Some(user),
            Recipient::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match &self.recipient {
            Recipient::Group(group) => Some(group),
            Recipient::User(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    id: MessageId,
    sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    receiver_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<GroupId>,
    #[serde(rename = "type")]
    kind: MessageType,
    content: String,
    status: MessageStatus,
    timestamp: i64,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        let (receiver_id, group_id) = match msg.recipient {
            Recipient::User(user) => (Some(user), None),
            Recipient::Group(group) => (None, Some(group)),
        };
        Self {
            id: msg.id,
            sender_id: msg.sender_id,
            receiver_id,
            group_id,
            kind: msg.kind,
            content: msg.content,
            status: msg.status,
            timestamp: msg.timestamp,
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            recipient: Recipient::from_parts(wire.receiver_id, wire.group_id)?,
            id: wire.id,
            sender_id: wire.sender_id,
            kind: wire.kind,
            content: wire.content,
            status: wire.status,
            timestamp: wire.timestamp,
        })
    }
}
