use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{backfill::room_history, bearer_token, presence};
use shared::{
    domain::{GroupSummary, MessageId, RoomId, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateGroupRequest, CreateGroupResponse, LoginRequest, LoginResponse, MessagePayload,
    },
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

use crate::{app_state::AppState, ws::ws_handler};

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const MAX_GROUP_NAME_BYTES: usize = 120;

pub(crate) type HttpError = (StatusCode, Json<ApiError>);

pub(crate) fn http_error(err: impl Into<ApiError>) -> HttpError {
    let err = err.into();
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::Unsupported => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

fn internal(err: anyhow::Error) -> HttpError {
    error!(error = %err, "request failed");
    http_error(ApiError::internal(err.to_string()))
}

fn validation(message: impl Into<String>) -> HttpError {
    http_error(ApiError::new(ErrorCode::Validation, message))
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/users", get(list_users))
        .route("/groups", get(list_groups).post(create_group))
        .route("/rooms/:room/messages", get(list_room_messages))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

/// Resolves the caller from the `Authorization: Bearer` header.
async fn caller(state: &AppState, headers: &HeaderMap) -> Result<UserId, HttpError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);
    presence::authenticate(&state.relay, token)
        .await
        .map_err(http_error)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.storage.health_check().await.map_err(|err| {
        error!(error = %err, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::internal("storage unavailable")),
        )
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    if req.username.trim().is_empty() {
        return Err(validation("username cannot be empty"));
    }
    let user_id = state
        .storage
        .create_user(&req.username, req.name.as_deref().unwrap_or_default())
        .await
        .map_err(internal)?;
    let user = state
        .storage
        .user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| http_error(ApiError::internal("user vanished after login")))?;
    let token = state
        .jwt
        .mint(user_id)
        .map_err(|err| internal(anyhow::Error::new(err)))?;

    info!(%user_id, username = %user.username, "login");
    Ok(Json(LoginResponse {
        token,
        user_id,
        name: user.name,
        user_name: user.username,
    }))
}

async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<UserSummary>>, HttpError> {
    let user_id = caller(&state, &headers).await?;
    let users = state
        .storage
        .list_users_except(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(users))
}

async fn list_groups(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<GroupSummary>>, HttpError> {
    let user_id = caller(&state, &headers).await?;
    let groups = state
        .storage
        .list_groups_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(groups))
}

async fn create_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<CreateGroupResponse>, HttpError> {
    let admin_id = caller(&state, &headers).await?;
    let name = req.group_name.trim();
    if name.is_empty() {
        return Err(validation("group name cannot be empty"));
    }
    if name.len() > MAX_GROUP_NAME_BYTES {
        return Err(validation("group name is too long"));
    }
    if req.user_ids.is_empty() {
        return Err(validation("a group needs at least one member besides the admin"));
    }
    for member in &req.user_ids {
        let exists = state.storage.user(*member).await.map_err(internal)?;
        if exists.is_none() {
            return Err(http_error(ApiError::new(
                ErrorCode::NotFound,
                format!("user {member} not found"),
            )));
        }
    }

    let group_id = state
        .storage
        .create_group(name, admin_id, &req.user_ids)
        .await
        .map_err(internal)?;
    info!(%group_id, %admin_id, members = req.user_ids.len(), "group created");
    Ok(Json(CreateGroupResponse {
        group_id,
        message: "group created".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    after: Option<i64>,
}

async fn list_room_messages(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    Query(q): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let user_id = caller(&state, &headers).await?;
    let room: RoomId = room
        .parse()
        .map_err(|err: shared::domain::InvalidRoomId| validation(err.to_string()))?;
    let messages = room_history(&state.relay, user_id, room, q.after.map(MessageId))
        .await
        .map_err(http_error)?;
    Ok(Json(messages))
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
