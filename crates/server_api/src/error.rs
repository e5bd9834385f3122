use shared::{
    domain::{MessageId, RoomId},
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use thiserror::Error;

/// Handshake failures. Any of these keeps the connection from being registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential verification timed out")]
    Timeout,
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        ApiError::new(ErrorCode::Unauthorized, value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("access to room {0} denied")]
    AccessDenied(RoomId),
    #[error("room {0} has not been joined on this connection")]
    NotJoined(RoomId),
    #[error("session has been replaced by a newer connection")]
    SessionReplaced,
    #[error("{0}")]
    Forbidden(String),
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Collaborator(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AccessDenied(_) | Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotJoined(_) | Self::Validation(_) => ErrorCode::Validation,
            Self::SessionReplaced => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Collaborator(_) | Self::Timeout(_) => ErrorCode::Internal,
        }
    }

    /// Errors after which the connection is closed rather than kept open.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AccessDenied(_) | Self::SessionReplaced)
    }

    pub fn to_event(&self, client_offset: Option<String>) -> ServerEvent {
        ServerEvent::Error {
            code: self.code(),
            message: self.to_string(),
            client_offset,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        ApiError::new(value.code(), value.to_string())
    }
}
