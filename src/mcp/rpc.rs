//! JSON-RPC error codes and mappings
//!
//! Provides the standard JSON-RPC 2.0 codes plus the transport-specific codes,
//! and the mapping of engine failures onto error replies.

use serde_json::json;

use crate::mcp::codec::{RequestId, Response};
use crate::mcp::engine::EngineError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// The session id supplied by the client is unknown or was closed.
pub const SESSION_NOT_FOUND: i64 = -32001;
pub const SERVER_SHUTTING_DOWN: i64 = -32002;
pub const REQUEST_CANCELLED: i64 = -32800;

pub fn is_error_response(response: &Response) -> bool {
    response.outcome.is_err()
}

pub fn engine_error_to_response(id: Option<RequestId>, err: &EngineError) -> Response {
    match err {
        EngineError::MethodNotFound(method) => Response::error_with_data(
            id,
            METHOD_NOT_FOUND,
            "Method not found",
            Some(json!({ "method": method })),
        ),
        EngineError::InvalidParams(message) => Response::error_with_data(
            id,
            INVALID_PARAMS,
            "Invalid params",
            Some(json!({ "message": message })),
        ),
        EngineError::Failed { code, message } => Response::error(id, *code, message),
        EngineError::Cancelled => Response::error(id, REQUEST_CANCELLED, "Request cancelled"),
        EngineError::Unavailable(_) => Response::error(id, INTERNAL_ERROR, "Internal error"),
    }
}
