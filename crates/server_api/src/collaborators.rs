//! Narrow interfaces to the systems the relay core depends on but does not own.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{GroupId, MessageId, MessageStatus, RoomId, UserId};
use storage::{NewMessage, Storage, StoredMessage};

use crate::error::AuthError;

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn memberships_of(&self, user_id: UserId) -> anyhow::Result<HashSet<GroupId>>;
    async fn admin_of(&self, group_id: GroupId) -> anyhow::Result<Option<UserId>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists the message and returns its id. Ids increase monotonically.
    async fn append(&self, message: NewMessage) -> anyhow::Result<MessageId>;
    /// Messages of `room` in ascending id order, restricted to `id > after`.
    async fn list_by_room(
        &self,
        room: RoomId,
        after: Option<MessageId>,
    ) -> anyhow::Result<Vec<StoredMessage>>;
    async fn find_by_id(&self, message_id: MessageId) -> anyhow::Result<Option<StoredMessage>>;
    async fn delete_by_id(&self, message_id: MessageId) -> anyhow::Result<bool>;
    /// Forward-only status transition; `false` when nothing changed.
    async fn advance_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> anyhow::Result<bool>;
    async fn edit_content(
        &self,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<StoredMessage>>;
}

#[async_trait]
impl GroupDirectory for Storage {
    async fn memberships_of(&self, user_id: UserId) -> anyhow::Result<HashSet<GroupId>> {
        self.group_ids_for_user(user_id).await
    }

    async fn admin_of(&self, group_id: GroupId) -> anyhow::Result<Option<UserId>> {
        self.group_admin(group_id).await
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn append(&self, message: NewMessage) -> anyhow::Result<MessageId> {
        self.insert_message(&message).await
    }

    async fn list_by_room(
        &self,
        room: RoomId,
        after: Option<MessageId>,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        self.list_room_messages(room, after).await
    }

    async fn find_by_id(&self, message_id: MessageId) -> anyhow::Result<Option<StoredMessage>> {
        self.load_message(message_id).await
    }

    async fn delete_by_id(&self, message_id: MessageId) -> anyhow::Result<bool> {
        self.delete_message(message_id).await
    }

    async fn advance_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> anyhow::Result<bool> {
        self.advance_message_status(message_id, status).await
    }

    async fn edit_content(
        &self,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<StoredMessage>> {
        self.edit_message(message_id, content, edited_at).await
    }
}
