//! In-memory collaborators for engine tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, MessageId, MessageStatus, RoomId, UserId},
    protocol::ServerEvent,
};
use storage::{NewMessage, StoredMessage};
use tokio::sync::mpsc::Receiver;

use crate::{
    AuthError, CredentialVerifier, GroupDirectory, MessageStore, Outbound, RelayConfig,
    RelayContext,
};

#[derive(Default)]
pub struct FakeCredentials {
    tokens: HashMap<String, UserId>,
}

impl FakeCredentials {
    pub fn with(mut self, token: &str, user_id: UserId) -> Self {
        self.tokens.insert(token.to_string(), user_id);
        self
    }
}

#[async_trait]
impl CredentialVerifier for FakeCredentials {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

#[derive(Default)]
pub struct FakeGroups {
    memberships: Mutex<HashMap<UserId, HashSet<GroupId>>>,
    admins: Mutex<HashMap<GroupId, UserId>>,
    pub fail: AtomicBool,
    pub delay: Mutex<Option<Duration>>,
}

impl FakeGroups {
    pub fn add_member(&self, group_id: GroupId, user_id: UserId) {
        self.memberships
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .insert(group_id);
    }

    pub fn remove_member(&self, group_id: GroupId, user_id: UserId) {
        if let Some(groups) = self.memberships.lock().unwrap().get_mut(&user_id) {
            groups.remove(&group_id);
        }
    }

    pub fn set_admin(&self, group_id: GroupId, user_id: UserId) {
        self.add_member(group_id, user_id);
        self.admins.lock().unwrap().insert(group_id, user_id);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl GroupDirectory for FakeGroups {
    async fn memberships_of(&self, user_id: UserId) -> anyhow::Result<HashSet<GroupId>> {
        self.pause().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn admin_of(&self, group_id: GroupId) -> anyhow::Result<Option<UserId>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("directory unavailable"));
        }
        Ok(self.admins.lock().unwrap().get(&group_id).copied())
    }
}

pub struct FakeMessageStore {
    rows: Mutex<BTreeMap<i64, StoredMessage>>,
    next_id: Mutex<i64>,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Fails only `advance_status`, leaving appends working.
    pub fail_status_updates: AtomicBool,
    pub appends: AtomicUsize,
}

impl Default for FakeMessageStore {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl FakeMessageStore {
    pub fn starting_at(first_id: i64) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(first_id),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_status_updates: AtomicBool::new(false),
            appends: AtomicUsize::new(0),
        }
    }

    pub fn seed(&self, sender_id: UserId, room: RoomId, content: &str) -> MessageId {
        let mut next = self.next_id.lock().unwrap();
        let id = MessageId(*next);
        *next += 1;
        self.rows.lock().unwrap().insert(
            id.0,
            StoredMessage {
                message_id: id,
                sender_id,
                room,
                content: content.to_string(),
                is_file: false,
                status: MessageStatus::Sent,
                client_offset: None,
                created_at: Utc::now(),
                edited_at: None,
            },
        );
        id
    }

    pub fn get(&self, message_id: MessageId) -> Option<StoredMessage> {
        self.rows.lock().unwrap().get(&message_id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageStore for FakeMessageStore {
    async fn append(&self, message: NewMessage) -> anyhow::Result<MessageId> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        self.appends.fetch_add(1, Ordering::SeqCst);
        let mut next = self.next_id.lock().unwrap();
        let id = MessageId(*next);
        *next += 1;
        self.rows.lock().unwrap().insert(
            id.0,
            StoredMessage {
                message_id: id,
                sender_id: message.sender_id,
                room: message.room,
                content: message.content,
                is_file: message.is_file,
                status: message.status,
                client_offset: message.client_offset,
                created_at: message.created_at,
                edited_at: None,
            },
        );
        Ok(id)
    }

    async fn list_by_room(
        &self,
        room: RoomId,
        after: Option<MessageId>,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let floor = after.map(|id| id.0).unwrap_or(0);
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.room == room && m.message_id.0 > floor)
            .cloned()
            .collect())
    }

    async fn find_by_id(&self, message_id: MessageId) -> anyhow::Result<Option<StoredMessage>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.get(message_id))
    }

    async fn delete_by_id(&self, message_id: MessageId) -> anyhow::Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.rows.lock().unwrap().remove(&message_id.0).is_some())
    }

    async fn advance_status(
        &self,
        message_id: MessageId,
        status: MessageStatus,
    ) -> anyhow::Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst)
            || self.fail_status_updates.load(Ordering::SeqCst)
        {
            return Err(anyhow!("status update failed"));
        }
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&message_id.0) {
            Some(row) if row.status.can_advance_to(status) => {
                row.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn edit_content(
        &self,
        message_id: MessageId,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<StoredMessage>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.get_mut(&message_id.0).map(|row| {
            row.content = content.to_string();
            row.edited_at = Some(edited_at);
            row.clone()
        }))
    }
}

pub struct Harness {
    pub ctx: RelayContext,
    pub groups: Arc<FakeGroups>,
    pub messages: Arc<FakeMessageStore>,
}

pub fn harness() -> Harness {
    harness_with(FakeMessageStore::default(), RelayConfig::default())
}

pub fn harness_with(messages: FakeMessageStore, mut config: RelayConfig) -> Harness {
    config.collaborator_timeout = Duration::from_millis(200);
    let credentials = FakeCredentials::default()
        .with("alice-token", UserId(1))
        .with("bob-token", UserId(2))
        .with("carol-token", UserId(3));
    let groups = Arc::new(FakeGroups::default());
    let messages = Arc::new(messages);
    let ctx = RelayContext::new(
        Arc::new(credentials),
        groups.clone(),
        messages.clone(),
        config,
    );
    Harness {
        ctx,
        groups,
        messages,
    }
}

pub fn drain(receiver: &mut Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = receiver.try_recv() {
        out.push(item);
    }
    out
}

/// Drained events only, skipping close markers.
pub fn drain_events(receiver: &mut Receiver<Outbound>) -> Vec<ServerEvent> {
    drain(receiver)
        .into_iter()
        .filter_map(|item| match item {
            Outbound::Event(event) => Some(event),
            Outbound::Close => None,
        })
        .collect()
}
