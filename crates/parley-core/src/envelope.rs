//! Wire envelope and the commands a client can send.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;
use crate::ids::{GroupId, MessageId, UserId};
use crate::messages::{Message, MessageStatus, MessageType, Recipient};

/// Envelope `type` values.
pub mod kinds {
    pub const LOGIN: &str = "login";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const ACK: &str = "ack";
    pub const SYNC_OFFLINE: &str = "sync_offline";
    pub const CREATE_GROUP: &str = "create_group";
    pub const JOIN_GROUP: &str = "join_group";
    pub const LEAVE_GROUP: &str = "leave_group";

    pub const NEW_MESSAGE: &str = "new_message";
    pub const NEW_GROUP_MESSAGE: &str = "new_group_message";
    pub const ERROR: &str = "error";
}

/// `{type, data, timestamp, message_id?}`. Transport only, never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: Utc::now().timestamp(),
            message_id: None,
        }
    }

    pub fn with_payload<T: Serialize>(kind: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("code".into(), Value::String(code.to_owned()));
        body.insert("message".into(), Value::String(message.into()));
        Self::new(kinds::ERROR, Value::Object(body))
    }

    /// Push envelope for a freshly sent message.
    pub fn push(message: &Message) -> Result<Self, serde_json::Error> {
        let kind = match message.recipient {
            Recipient::User(_) => kinds::NEW_MESSAGE,
            Recipient::Group(_) => kinds::NEW_GROUP_MESSAGE,
        };
        let mut env = Self::with_payload(kind, message)?;
        env.message_id = Some(message.id.to_string());
        Ok(env)
    }

    pub fn reply_to(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed {
            detail: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LoginRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Deserialize)]
struct RawSendMessage {
    #[serde(default)]
    receiver_id: Option<UserId>,
    #[serde(default)]
    group_id: Option<GroupId>,
    #[serde(rename = "type", default)]
    kind: MessageType,
    content: String,
}

/// A validated `send_message` body: exactly one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendMessageRequest {
    pub recipient: Recipient,
    pub kind: MessageType,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AckRequest {
    pub message_id: MessageId,
    pub status: MessageStatus,
}

#[derive(Deserialize)]
struct RawSyncOffline {
    #[serde(default)]
    last_message_id: Option<MessageId>,
    #[serde(default)]
    limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOfflineRequest {
    pub last_message_id: Option<MessageId>,
    /// Zero means "use the server default".
    pub limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub members: Vec<UserId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct GroupRequest {
    pub group_id: GroupId,
}

/// A decoded client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Login(LoginRequest),
    Heartbeat(HeartbeatRequest),
    SendMessage(SendMessageRequest),
    Ack(AckRequest),
    SyncOffline(SyncOfflineRequest),
    CreateGroup(CreateGroupRequest),
    JoinGroup(GroupRequest),
    LeaveGroup(GroupRequest),
}

impl Command {
    pub fn from_envelope(env: &Envelope) -> Result<Self, ProtocolError> {
        let kind = env.kind.as_str();
        let command = match kind {
            kinds::LOGIN => {
                let req: LoginRequest = payload(kind, &env.data)?;
                if req.user_id.is_empty() {
                    return Err(ProtocolError::invalid_payload(kind, "user_id is empty"));
                }
                Self::Login(req)
            }
            kinds::HEARTBEAT => Self::Heartbeat(payload(kind, &env.data)?),
            kinds::SEND_MESSAGE => {
                let raw: RawSendMessage = payload(kind, &env.data)?;
                Self::SendMessage(SendMessageRequest {
                    recipient: Recipient::from_parts(raw.receiver_id, raw.group_id)?,
                    kind: raw.kind,
                    content: raw.content,
                })
            }
            kinds::ACK => {
                let req: AckRequest = payload(kind, &env.data)?;
                if req.status == MessageStatus::Sent {
                    return Err(ProtocolError::invalid_payload(kind, "cannot ack with status sent"));
                }
                Self::Ack(req)
            }
            kinds::SYNC_OFFLINE => {
                let raw: RawSyncOffline = payload(kind, &env.data)?;
                Self::SyncOffline(SyncOfflineRequest {
                    last_message_id: raw.last_message_id.filter(|id| !id.is_empty()),
                    limit: raw.limit,
                })
            }
            kinds::CREATE_GROUP => {
                let req: CreateGroupRequest = payload(kind, &env.data)?;
                if req.name.trim().is_empty() {
                    return Err(ProtocolError::invalid_payload(kind, "name is empty"));
                }
                Self::CreateGroup(req)
            }
            kinds::JOIN_GROUP => Self::JoinGroup(group_payload(kind, &env.data)?),
            kinds::LEAVE_GROUP => Self::LeaveGroup(group_payload(kind, &env.data)?),
            other => {
                return Err(ProtocolError::UnknownType {
                    kind: other.to_owned(),
                })
            }
        };
        Ok(command)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Login(_) => kinds::LOGIN,
            Self::Heartbeat(_) => kinds::HEARTBEAT,
            Self::SendMessage(_) => kinds::SEND_MESSAGE,
            Self::Ack(_) => kinds::ACK,
            Self::SyncOffline(_) => kinds::SYNC_OFFLINE,
            Self::CreateGroup(_) => kinds::CREATE_GROUP,
            Self::JoinGroup(_) => kinds::JOIN_GROUP,
            Self::LeaveGroup(_) => kinds::LEAVE_GROUP,
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: &Value) -> Result<T, ProtocolError> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data.clone()
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::invalid_payload(kind, e))
}

fn group_payload(kind: &str, data: &Value) -> Result<GroupRequest, ProtocolError> {
    let req: GroupRequest = payload(kind, data)?;
    if req.group_id.is_empty() {
        return Err(ProtocolError::invalid_payload(kind, "group_id is empty"));
    }
    Ok(req)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    pub user_id: UserId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub message_id: MessageId,
    pub status: MessageStatus,
    /// False when the update would have moved the status backwards.
    pub applied: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOfflineResponse {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembershipResponse {
    pub group_id: GroupId,
    pub member: bool,
    /// False when the call left membership as it was.
    pub changed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(frame: Value) -> Result<Command, ProtocolError> {
        let env = Envelope::decode(&frame.to_string())?;
        Command::from_envelope(&env)
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Envelope::decode("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn decode_tolerates_missing_data_and_timestamp() {
        let env = Envelope::decode(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env.kind, "heartbeat");
        assert!(env.data.is_null());
        assert_eq!(env.timestamp, 0);
        assert_eq!(
            Command::from_envelope(&env).unwrap(),
            Command::Heartbeat(HeartbeatRequest::default())
        );
    }

    #[test]
    fn encode_includes_message_id_only_when_set() {
        let env = Envelope::new("heartbeat", json!({}));
        let v: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert!(v.get("message_id").is_none());
        assert_eq!(v["type"], "heartbeat");

        let env = env.reply_to(Some("req-1".into()));
        let v: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(v["message_id"], "req-1");
    }

    #[test]
    fn unknown_type_is_reported() {
        let err = command(json!({"type": "poke", "data": {}})).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType { kind: "poke".into() });
    }

    #[test]
    fn login_parses_and_requires_user() {
        let cmd = command(json!({
            "type": "login",
            "data": {"user_id": "alice", "token": "t", "platform": "ios"}
        }))
        .unwrap();
        match cmd {
            Command::Login(req) => {
                assert_eq!(req.user_id.as_str(), "alice");
                assert_eq!(req.platform, "ios");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = command(json!({"type": "login", "data": {"user_id": ""}})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn send_message_resolves_recipient() {
        let cmd = command(json!({
            "type": "send_message",
            "data": {"receiver_id": "bob", "type": "image", "content": "x.png"}
        }))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SendMessage(SendMessageRequest {
                recipient: Recipient::User(UserId::from_raw("bob")),
                kind: MessageType::Image,
                content: "x.png".into(),
            })
        );

        let cmd = command(json!({
            "type": "send_message",
            "data": {"group_id": "grp_1", "content": "hey"}
        }))
        .unwrap();
        assert!(matches!(
            cmd,
            Command::SendMessage(SendMessageRequest { recipient: Recipient::Group(_), kind: MessageType::Text, .. })
        ));
    }

    #[test]
    fn send_message_without_recipient_is_rejected() {
        let err = command(json!({"type": "send_message", "data": {"content": "x"}})).unwrap_err();
        assert_eq!(err, ProtocolError::MissingRecipient);

        let err = command(json!({
            "type": "send_message",
            "data": {"receiver_id": "bob", "group_id": "grp_1", "content": "x"}
        }))
        .unwrap_err();
        assert_eq!(err, ProtocolError::AmbiguousRecipient);
    }

    #[test]
    fn ack_rejects_sent_status() {
        let err = command(json!({
            "type": "ack",
            "data": {"message_id": "msg_1", "status": "sent"}
        }))
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

        let cmd = command(json!({
            "type": "ack",
            "data": {"message_id": "msg_1", "status": "read"}
        }))
        .unwrap();
        assert!(matches!(cmd, Command::Ack(AckRequest { status: MessageStatus::Read, .. })));
    }

    #[test]
    fn sync_offline_treats_empty_cursor_as_none() {
        let cmd = command(json!({
            "type": "sync_offline",
            "data": {"last_message_id": "", "limit": 2}
        }))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SyncOffline(SyncOfflineRequest {
                last_message_id: None,
                limit: 2
            })
        );
    }

    #[test]
    fn group_commands_need_group_id() {
        let err = command(json!({"type": "join_group", "data": {"group_id": ""}})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
        let cmd = command(json!({"type": "leave_group", "data": {"group_id": "grp_9"}})).unwrap();
        assert_eq!(cmd.kind(), kinds::LEAVE_GROUP);
    }

    #[test]
    fn push_envelope_kind_follows_recipient() {
        let msg = Message::new(
            MessageId::from_raw("msg_1"),
            UserId::from_raw("alice"),
            Recipient::Group(GroupId::from_raw("grp_1")),
            MessageType::Text,
            "hi",
        );
        let env = Envelope::push(&msg).unwrap();
        assert_eq!(env.kind, kinds::NEW_GROUP_MESSAGE);
        assert_eq!(env.message_id.as_deref(), Some("msg_1"));
        assert_eq!(env.data["group_id"], "grp_1");
    }

    #[test]
    fn error_envelope_carries_code() {
        let env = Envelope::error("PROTOCOL_ERROR", "bad frame");
        assert_eq!(env.kind, kinds::ERROR);
        assert_eq!(env.data["code"], "PROTOCOL_ERROR");
        assert_eq!(env.data["message"], "bad frame");
    }
}
