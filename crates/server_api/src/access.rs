use shared::domain::{RoomId, UserId};
use tracing::warn;

use crate::RelayContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Direct room that does not encode the caller's id.
    NotParticipant,
    /// Group room missing from the caller's memberships.
    NotMember,
    /// Membership lookup failed or timed out.
    LookupFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Granted,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Decides whether `user_id` may join `room`. Fails closed: any error while
/// consulting the group directory is a denial.
pub async fn can_join(ctx: &RelayContext, user_id: UserId, room: RoomId) -> AccessDecision {
    match room {
        RoomId::Direct(a, b) => {
            if user_id == a || user_id == b {
                AccessDecision::Granted
            } else {
                AccessDecision::Denied(DenyReason::NotParticipant)
            }
        }
        RoomId::Group(group_id) => {
            let lookup = ctx
                .bounded("group membership lookup", ctx.groups.memberships_of(user_id))
                .await;
            match lookup {
                Ok(groups) if groups.contains(&group_id) => AccessDecision::Granted,
                Ok(_) => AccessDecision::Denied(DenyReason::NotMember),
                Err(err) => {
                    warn!(%user_id, %room, error = %err, "membership lookup failed, denying");
                    AccessDecision::Denied(DenyReason::LookupFailed(err.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/access_tests.rs"]
mod tests;
