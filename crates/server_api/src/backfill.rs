use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use storage::StoredMessage;
use tracing::debug;

use crate::{
    access::can_join, error::EngineError, BackfillDelivery, ConnectionHandle, RelayContext,
};

pub(crate) fn payload_from_stored(message: StoredMessage, new_message: bool) -> MessagePayload {
    MessagePayload {
        id: message.message_id,
        from: message.sender_id,
        room: message.room,
        content: message.content,
        is_file: message.is_file,
        msg_status: message.status,
        client_offset: message.client_offset,
        new_message,
        created_at: message.created_at,
        edited_at: message.edited_at,
    }
}

/// Stored history of `room` in ascending id order, each entry marked as not
/// new. With `client_offset` set only messages after that id are returned.
///
/// Callers must have authorized the requester for `room` first.
pub async fn backfill(
    ctx: &RelayContext,
    room: RoomId,
    client_offset: Option<MessageId>,
) -> Result<Vec<MessagePayload>, EngineError> {
    let stored = ctx
        .bounded(
            "message history fetch",
            ctx.messages.list_by_room(room, client_offset),
        )
        .await?;
    Ok(stored
        .into_iter()
        .map(|message| payload_from_stored(message, false))
        .collect())
}

/// Fetches history for a freshly joined connection and delivers it according
/// to the configured [`BackfillDelivery`]. Returns the number of messages replayed.
pub(crate) async fn replay(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
    client_offset: Option<MessageId>,
) -> Result<usize, EngineError> {
    let history = backfill(ctx, room, client_offset).await?;
    let count = history.len();

    for message in history {
        let event = ServerEvent::Message(message);
        match ctx.config.backfill_delivery {
            BackfillDelivery::Joiner => {
                if !conn.deliver(event).await {
                    break;
                }
            }
            BackfillDelivery::Room => {
                ctx.sessions.broadcast(room, event).await;
            }
        }
    }

    debug!(
        user_id = %conn.user_id(),
        %room,
        replayed = count,
        offset = ?client_offset.map(|id| id.0),
        "backfill delivered"
    );
    Ok(count)
}

/// History read outside a live connection, e.g. over HTTP. Access is checked
/// here; a denial is an error rather than a disconnect.
pub async fn room_history(
    ctx: &RelayContext,
    user_id: UserId,
    room: RoomId,
    after: Option<MessageId>,
) -> Result<Vec<MessagePayload>, EngineError> {
    if !can_join(ctx, user_id, room).await.is_granted() {
        return Err(EngineError::AccessDenied(room));
    }
    backfill(ctx, room, after).await
}

#[cfg(test)]
#[path = "tests/backfill_tests.rs"]
mod tests;
