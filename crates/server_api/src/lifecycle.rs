use chrono::Utc;
use shared::{
    domain::{MessageId, MessageStatus, RoomId},
    protocol::{AdminAction, AdminControlEvent, AdminControlRequest, MessageDraft, ServerEvent},
};
use storage::{NewMessage, StoredMessage};
use tracing::{debug, info, warn};

use crate::{backfill::payload_from_stored, error::EngineError, ConnectionHandle, RelayContext};

/// Upper bound on message content, file references included.
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

async fn require_joined(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
) -> Result<(), EngineError> {
    if ctx.sessions.is_subscribed(conn, room).await {
        Ok(())
    } else {
        Err(EngineError::NotJoined(room))
    }
}

fn validate_content(content: &str) -> Result<(), EngineError> {
    if content.trim().is_empty() {
        return Err(EngineError::Validation("message content cannot be empty".into()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(EngineError::Validation(format!(
            "message content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Loads `message_id` and checks it belongs to `room`. A message from another
/// room is reported as missing.
async fn load_in_room(
    ctx: &RelayContext,
    message_id: MessageId,
    room: RoomId,
) -> Result<StoredMessage, EngineError> {
    let message = ctx
        .bounded("message lookup", ctx.messages.find_by_id(message_id))
        .await?
        .ok_or(EngineError::NotFound(message_id))?;
    if message.room != room {
        return Err(EngineError::NotFound(message_id));
    }
    Ok(message)
}

/// Moves a message forward and tells the room, but only when the stored
/// status actually changed.
async fn advance_and_announce(
    ctx: &RelayContext,
    room: RoomId,
    message_id: MessageId,
    status: MessageStatus,
) -> Result<bool, EngineError> {
    let changed = ctx
        .bounded(
            "status update",
            ctx.messages.advance_status(message_id, status),
        )
        .await?;
    if changed {
        ctx.sessions
            .broadcast(
                room,
                ServerEvent::MessageStatusUpdate {
                    id: message_id,
                    msg_status: status,
                },
            )
            .await;
    }
    Ok(changed)
}

/// Persists a message from `conn`, fans it out to the room, then marks it
/// delivered.
///
/// Once the room has the message, `submit` succeeds: a failed delivered
/// update is only logged, since the client would otherwise resend it.
pub async fn submit(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    draft: MessageDraft,
) -> Result<MessageId, EngineError> {
    let room = draft.room;
    require_joined(ctx, conn, room).await?;
    validate_content(&draft.content)?;

    let status = ctx.config.default_message_status;
    let new_message = NewMessage {
        sender_id: conn.user_id(),
        room,
        content: draft.content,
        is_file: draft.is_file,
        status,
        client_offset: draft.client_offset,
        created_at: Utc::now(),
    };
    let message_id = ctx
        .bounded("message append", ctx.messages.append(new_message.clone()))
        .await?;

    let payload = payload_from_stored(
        StoredMessage {
            message_id,
            sender_id: new_message.sender_id,
            room,
            content: new_message.content,
            is_file: new_message.is_file,
            status,
            client_offset: new_message.client_offset,
            created_at: new_message.created_at,
            edited_at: None,
        },
        true,
    );
    let recipients = ctx
        .sessions
        .broadcast(room, ServerEvent::Message(payload))
        .await;
    info!(%message_id, user_id = %conn.user_id(), %room, recipients, "message stored");

    if let Err(err) = advance_and_announce(ctx, room, message_id, MessageStatus::Delivered).await {
        warn!(%message_id, %room, error = %err, "delivered update failed");
    }
    Ok(message_id)
}

/// Marks a message read. Nothing is broadcast if it already was.
pub async fn mark_read(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
    message_id: MessageId,
) -> Result<bool, EngineError> {
    require_joined(ctx, conn, room).await?;
    load_in_room(ctx, message_id, room).await?;
    advance_and_announce(ctx, room, message_id, MessageStatus::Read).await
}

pub async fn delete_message(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
    message_id: MessageId,
) -> Result<(), EngineError> {
    require_joined(ctx, conn, room).await?;
    let message = load_in_room(ctx, message_id, room).await?;

    let user_id = conn.user_id();
    let allowed = if message.sender_id == user_id {
        true
    } else if let Some(group_id) = room.group_id() {
        let admin = ctx
            .bounded("group admin lookup", ctx.groups.admin_of(group_id))
            .await?;
        admin == Some(user_id)
    } else {
        false
    };
    if !allowed {
        return Err(EngineError::Forbidden(format!(
            "user {user_id} may not delete message {message_id}"
        )));
    }

    let removed = ctx
        .bounded("message delete", ctx.messages.delete_by_id(message_id))
        .await?;
    if !removed {
        return Err(EngineError::NotFound(message_id));
    }

    ctx.sessions
        .broadcast(
            room,
            ServerEvent::AdminControl(AdminControlEvent {
                action: AdminAction::Delete,
                message_id,
                user_id,
                group_id: room,
                content: None,
                edited_at: None,
            }),
        )
        .await;
    info!(%message_id, %user_id, %room, "message deleted");
    Ok(())
}

pub async fn edit_message(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
    message_id: MessageId,
    content: String,
) -> Result<(), EngineError> {
    require_joined(ctx, conn, room).await?;
    validate_content(&content)?;
    let message = load_in_room(ctx, message_id, room).await?;

    let user_id = conn.user_id();
    if message.sender_id != user_id {
        return Err(EngineError::Forbidden(format!(
            "only the sender may edit message {message_id}"
        )));
    }

    let edited = ctx
        .bounded(
            "message edit",
            ctx.messages.edit_content(message_id, &content, Utc::now()),
        )
        .await?
        .ok_or(EngineError::NotFound(message_id))?;

    ctx.sessions
        .broadcast(
            room,
            ServerEvent::AdminControl(AdminControlEvent {
                action: AdminAction::Edit,
                message_id,
                user_id,
                group_id: room,
                content: Some(edited.content),
                edited_at: edited.edited_at,
            }),
        )
        .await;
    debug!(%message_id, %user_id, %room, "message edited");
    Ok(())
}

/// Routes an `admin_control` request to the matching operation.
pub async fn admin_control(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    request: AdminControlRequest,
) -> Result<(), EngineError> {
    let AdminControlRequest {
        action,
        message_id,
        group_id: room,
        content,
    } = request;
    match action {
        AdminAction::Delete => delete_message(ctx, conn, room, message_id).await,
        AdminAction::Edit => {
            let content = content
                .ok_or_else(|| EngineError::Validation("edit requires content".into()))?;
            edit_message(ctx, conn, room, message_id, content).await
        }
        AdminAction::Unsupported => Err(EngineError::Unsupported(
            "unsupported admin_control type".into(),
        )),
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
