use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    domain::{GroupId, MessageId, MessageStatus, RoomId, UserId},
    error::ErrorCode,
};

/// Join offsets arrive either as a number or as a numeric string, like room ids.
/// An empty string counts as no offset.
fn offset_from_number_or_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<MessageId>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(id)) => Ok(Some(MessageId(id))),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(|id| Some(MessageId(id)))
            .map_err(|_| serde::de::Error::custom(format!("invalid clientOffset '{text}'"))),
    }
}

/// Frames sent by clients over the persistent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "join_group")]
    JoinGroup {
        room_id: RoomId,
        /// Id of the newest message the client already holds.
        #[serde(
            rename = "clientOffset",
            default,
            deserialize_with = "offset_from_number_or_string"
        )]
        client_offset: Option<MessageId>,
    },
    #[serde(rename = "leave_group")]
    LeaveGroup { room_id: RoomId },
    #[serde(rename = "message")]
    Message(MessageDraft),
    #[serde(rename = "typing")]
    Typing {
        #[serde(alias = "groupId")]
        room: RoomId,
    },
    #[serde(rename = "admin_control")]
    AdminControl(AdminControlRequest),
    #[serde(rename = "mark_read", rename_all = "camelCase")]
    MarkRead { room: RoomId, message_id: MessageId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    #[serde(alias = "group")]
    pub room: RoomId,
    #[serde(alias = "message")]
    pub content: String,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_offset: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Delete,
    Edit,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminControlRequest {
    #[serde(rename = "type")]
    pub action: AdminAction,
    pub message_id: MessageId,
    #[serde(alias = "room")]
    pub group_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// A stored or freshly submitted message as broadcast to room members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub from: UserId,
    pub room: RoomId,
    pub content: String,
    pub is_file: bool,
    pub msg_status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_offset: Option<String>,
    /// `false` for history replayed on join, so clients can tell it apart
    /// from live traffic.
    pub new_message: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdminControlEvent {
    #[serde(rename = "type")]
    pub action: AdminAction,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub group_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Frames pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message")]
    Message(MessagePayload),
    #[serde(rename = "messageStatusUpdate", rename_all = "camelCase")]
    MessageStatusUpdate {
        id: MessageId,
        msg_status: MessageStatus,
    },
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing { user_id: UserId, room: RoomId },
    #[serde(rename = "admin_control")]
    AdminControl(AdminControlEvent),
    #[serde(rename = "joined")]
    Joined { room: RoomId, backfilled: usize },
    #[serde(rename = "unauthorized_access")]
    UnauthorizedAccess { access: bool },
    #[serde(rename = "session_replaced")]
    SessionReplaced,
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_offset: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            client_offset: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::MessageStatusUpdate { .. } => "messageStatusUpdate",
            Self::Typing { .. } => "typing",
            Self::AdminControl(_) => "admin_control",
            Self::Joined { .. } => "joined",
            Self::UnauthorizedAccess { .. } => "unauthorized_access",
            Self::SessionReplaced => "session_replaced",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: UserId,
    pub name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub group_name: String,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupResponse {
    pub group_id: GroupId,
    pub message: String,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
