use std::{future::Future, str::FromStr, sync::Arc, time::Duration};

use shared::domain::MessageStatus;
use storage::Storage;

pub mod access;
pub mod auth;
pub mod backfill;
pub mod collaborators;
pub mod error;
pub mod lifecycle;
pub mod presence;
pub mod sessions;

pub use access::{can_join, AccessDecision, DenyReason};
pub use auth::{bearer_token, JwtAuthority};
pub use collaborators::{CredentialVerifier, GroupDirectory, MessageStore};
pub use error::{AuthError, EngineError};
pub use sessions::{
    ConnectionHandle, ConnectionId, Outbound, SessionRegistry, OUTBOUND_QUEUE_CAPACITY,
};

/// Who receives history replayed on join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackfillDelivery {
    /// Only the connection that joined.
    #[default]
    Joiner,
    /// Every connection subscribed to the room.
    Room,
}

impl FromStr for BackfillDelivery {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "joiner" => Ok(Self::Joiner),
            "room" => Ok(Self::Room),
            other => Err(format!("unknown backfill delivery '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Status assigned to a message when it is first stored.
    pub default_message_status: MessageStatus,
    pub backfill_delivery: BackfillDelivery,
    /// Upper bound for every collaborator call made while handling an event.
    pub collaborator_timeout: Duration,
    /// Per-connection outbound queue size; a member that falls this far
    /// behind is evicted.
    pub outbound_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_message_status: MessageStatus::Sent,
            backfill_delivery: BackfillDelivery::Joiner,
            collaborator_timeout: Duration::from_secs(5),
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct RelayContext {
    pub sessions: SessionRegistry,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub groups: Arc<dyn GroupDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub config: RelayConfig,
}

impl RelayContext {
    pub fn new(
        credentials: Arc<dyn CredentialVerifier>,
        groups: Arc<dyn GroupDirectory>,
        messages: Arc<dyn MessageStore>,
        config: RelayConfig,
    ) -> Self {
        Self {
            sessions: SessionRegistry::with_capacity(config.outbound_queue_capacity),
            credentials,
            groups,
            messages,
            config,
        }
    }

    pub fn with_storage(storage: Storage, jwt: JwtAuthority, config: RelayConfig) -> Self {
        let storage = Arc::new(storage);
        Self::new(Arc::new(jwt), storage.clone(), storage, config)
    }

    /// Runs a collaborator call under the configured timeout.
    pub(crate) async fn bounded<T, F>(&self, what: &'static str, call: F) -> Result<T, EngineError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.config.collaborator_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(EngineError::Collaborator(format!("{what} failed: {err:#}"))),
            Err(_) => Err(EngineError::Timeout(what)),
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;
