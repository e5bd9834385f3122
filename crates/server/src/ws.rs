use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{bearer_token, presence, ConnectionHandle, Outbound, RelayContext};
use shared::domain::UserId;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{app_state::AppState, http::http_error};

/// How long the writer gets to flush queued events once the reader is done.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

/// Authenticates before upgrading: a missing or bad credential is a plain 401
/// and no session is ever registered.
pub(crate) async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_owned)
        .or(q.token);

    let user_id = match presence::authenticate(&state.relay, token.as_deref()).await {
        Ok(user_id) => user_id,
        Err(err) => {
            warn!(error = %err, "websocket handshake rejected");
            return http_error(err).into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| run_connection(state, socket, user_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn run_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let relay = state.relay.clone();
    let (conn, outbound) = presence::connect(&relay, user_id).await;
    let (mut sink, stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        let mut outbound = ReceiverStream::new(outbound);
        while let Some(item) = outbound.next().await {
            match item {
                Outbound::Event(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(error) => {
                            warn!(%error, event = event.name(), "failed to encode event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let writer_finished = tokio::select! {
        _ = &mut writer => true,
        _ = read_loop(&relay, &conn, stream) => false,
        _ = conn.overflowed() => {
            warn!(%user_id, connection_id = %conn.id(), "client fell behind, dropping connection");
            false
        }
    };

    presence::disconnect(&relay, &conn).await;

    if !writer_finished {
        conn.close();
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }
    debug!(%user_id, connection_id = %conn.id(), "connection closed");
}

async fn read_loop(
    relay: &RelayContext,
    conn: &ConnectionHandle,
    mut stream: futures::stream::SplitStream<WebSocket>,
) {
    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, connection_id = %conn.id(), "websocket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if let Err(err) = presence::handle_text(relay, conn, &text).await {
                    if err.is_terminal() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
