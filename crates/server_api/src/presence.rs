//! Connection lifecycle and the per-connection event loop body: handshake,
//! room joins, typing, and dispatch of client frames.

use shared::{
    domain::{MessageId, RoomId, UserId},
    protocol::{ClientEvent, ServerEvent},
};
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

use crate::{
    access::{can_join, AccessDecision},
    backfill::replay,
    error::{AuthError, EngineError},
    lifecycle, ConnectionHandle, Outbound, RelayContext,
};

/// Verifies the handshake credential within the collaborator timeout.
pub async fn authenticate(ctx: &RelayContext, token: Option<&str>) -> Result<UserId, AuthError> {
    let token = token.map(str::trim).filter(|t| !t.is_empty());
    let Some(token) = token else {
        return Err(AuthError::Missing);
    };
    match tokio::time::timeout(
        ctx.config.collaborator_timeout,
        ctx.credentials.verify(token),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(AuthError::Timeout),
    }
}

/// Registers an authenticated connection, displacing any older session.
pub async fn connect(
    ctx: &RelayContext,
    user_id: UserId,
) -> (ConnectionHandle, Receiver<Outbound>) {
    ctx.sessions.register(user_id).await
}

pub async fn disconnect(ctx: &RelayContext, conn: &ConnectionHandle) {
    let removed = ctx.sessions.unregister(conn).await;
    debug!(user_id = %conn.user_id(), connection_id = %conn.id(), removed, "disconnected");
}

/// Authorizes `conn` for `room`, subscribes it and replays history.
///
/// A denied join tears the connection down: the client is told via
/// `unauthorized_access`, then unsubscribed, unregistered and closed. A
/// history failure only aborts the join. Returns the number of replayed
/// messages.
pub async fn join_room(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
    client_offset: Option<MessageId>,
) -> Result<usize, EngineError> {
    if !ctx.sessions.is_current(conn).await {
        return Err(EngineError::SessionReplaced);
    }

    let user_id = conn.user_id();
    if let AccessDecision::Denied(reason) = can_join(ctx, user_id, room).await {
        warn!(%user_id, %room, ?reason, "join denied, disconnecting");
        conn.send(ServerEvent::UnauthorizedAccess { access: false });
        ctx.sessions.unsubscribe(conn, room).await;
        ctx.sessions.unregister(conn).await;
        conn.close();
        return Err(EngineError::AccessDenied(room));
    }

    if !ctx.sessions.subscribe(conn, room).await {
        return Err(EngineError::SessionReplaced);
    }

    match replay(ctx, conn, room, client_offset).await {
        Ok(backfilled) => {
            conn.send(ServerEvent::Joined { room, backfilled });
            info!(%user_id, %room, backfilled, "joined room");
            Ok(backfilled)
        }
        Err(err) => {
            ctx.sessions.unsubscribe(conn, room).await;
            warn!(%user_id, %room, error = %err, "backfill failed, join aborted");
            Err(err)
        }
    }
}

pub async fn leave_room(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
) -> Result<(), EngineError> {
    if ctx.sessions.unsubscribe(conn, room).await {
        debug!(user_id = %conn.user_id(), %room, "left room");
        Ok(())
    } else {
        Err(EngineError::NotJoined(room))
    }
}

pub async fn typing(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    room: RoomId,
) -> Result<(), EngineError> {
    if !ctx.sessions.is_subscribed(conn, room).await {
        return Err(EngineError::NotJoined(room));
    }
    ctx.sessions
        .broadcast(
            room,
            ServerEvent::Typing {
                user_id: conn.user_id(),
                room,
            },
        )
        .await;
    Ok(())
}

/// Handles one client event. Failures that keep the connection open are
/// reported back to the sender as an `error` event before being returned.
pub async fn dispatch(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    event: ClientEvent,
) -> Result<(), EngineError> {
    let mut client_offset = None;
    let result = match event {
        ClientEvent::JoinGroup {
            room_id,
            client_offset,
        } => join_room(ctx, conn, room_id, client_offset).await.map(drop),
        ClientEvent::LeaveGroup { room_id } => leave_room(ctx, conn, room_id).await,
        ClientEvent::Message(draft) => {
            client_offset = draft.client_offset.clone();
            lifecycle::submit(ctx, conn, draft).await.map(drop)
        }
        ClientEvent::Typing { room } => typing(ctx, conn, room).await,
        ClientEvent::AdminControl(request) => lifecycle::admin_control(ctx, conn, request).await,
        ClientEvent::MarkRead { room, message_id } => {
            lifecycle::mark_read(ctx, conn, room, message_id)
                .await
                .map(drop)
        }
    };

    if let Err(err) = &result {
        if !err.is_terminal() {
            debug!(user_id = %conn.user_id(), error = %err, "event rejected");
            conn.send(err.to_event(client_offset));
        }
    }
    result
}

/// Parses a raw text frame and dispatches it. Malformed frames are answered
/// with a validation error and do not close the connection.
pub async fn handle_text(
    ctx: &RelayContext,
    conn: &ConnectionHandle,
    text: &str,
) -> Result<(), EngineError> {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => dispatch(ctx, conn, event).await,
        Err(err) => {
            let err = EngineError::Validation(format!("malformed event: {err}"));
            conn.send(err.to_event(None));
            Err(err)
        }
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
