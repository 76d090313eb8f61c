use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::mcp::codec::{encode_value, DecodeError, Response as RpcResponse};
use crate::mcp::rpc::{INTERNAL_ERROR, INVALID_REQUEST, SERVER_SHUTTING_DOWN, SESSION_NOT_FOUND};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("session header is missing")]
    MissingSession,
    #[error("session header is not valid: {0}")]
    InvalidSessionHeader(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("session closed")]
    SessionClosed,
    #[error("no stream attached to session")]
    StreamNotAttached,
    #[error("session identifiers exhausted")]
    IdentifiersExhausted,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("protocol engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Decode(_) | Self::MissingSession | Self::InvalidSessionHeader(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::SessionClosed | Self::StreamNotAttached => StatusCode::GONE,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::IdentifiersExhausted | Self::EngineUnavailable(_) | Self::Fatal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON-RPC error reply describing this failure, with `id: null`.
    pub fn to_rpc_response(&self) -> RpcResponse {
        match self {
            Self::Decode(err) => RpcResponse::error(None, err.code(), err.message()),
            Self::MissingSession => RpcResponse::error(
                None,
                INVALID_REQUEST,
                "Bad Request: session header is required",
            ),
            Self::InvalidSessionHeader(_) => RpcResponse::error(
                None,
                INVALID_REQUEST,
                "Bad Request: session header is not valid",
            ),
            Self::SessionNotFound => RpcResponse::error(
                None,
                SESSION_NOT_FOUND,
                "Session not found: start a new session",
            ),
            Self::SessionClosed | Self::StreamNotAttached => {
                RpcResponse::error(None, SESSION_NOT_FOUND, "Session closed")
            }
            Self::ShuttingDown => {
                RpcResponse::error(None, SERVER_SHUTTING_DOWN, "Server is shutting down")
            }
            Self::IdentifiersExhausted | Self::EngineUnavailable(_) | Self::Fatal(_) => {
                RpcResponse::error(None, INTERNAL_ERROR, "Internal error")
            }
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed with transport error");
        }

        (status, Json(encode_value(&self.to_rpc_response()))).into_response()
    }
}
