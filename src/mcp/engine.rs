//! Interface between the transport and the protocol engine
//!
//! The engine implements method semantics; the transport only routes calls
//! to it and delivers what it returns.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::mcp::codec::{OutboundMessage, RequestId};
use crate::transport::session::{Session, SessionId, SessionRegistry};

/// Capabilities an engine declares; queried at startup and advertised during
/// session negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub tools: bool,
    pub logging: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineReply {
    pub value: Value,
    /// Forces delivery on the originating HTTP response even when a stream
    /// is attached to the session.
    pub immediate: bool,
}

impl EngineReply {
    pub fn immediate(value: Value) -> Self {
        Self {
            value,
            immediate: true,
        }
    }

    pub fn deferred(value: Value) -> Self {
        Self {
            value,
            immediate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("engine call failed ({code}): {message}")]
    Failed { code: i64, message: String },
    #[error("request cancelled")]
    Cancelled,
    /// Not answerable with a protocol error; surfaces as HTTP 500.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: crate::mcp::rpc::INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

/// Pushes server-initiated events to whatever stream the session has attached
/// at the time of the call.
#[derive(Clone)]
pub struct Notifier {
    registry: SessionRegistry,
    session_id: SessionId,
}

impl Notifier {
    pub fn new(registry: SessionRegistry, session_id: SessionId) -> Self {
        Self {
            registry,
            session_id,
        }
    }

    pub async fn send_event(&self, event: Value) -> Result<(), TransportError> {
        self.registry
            .publish(&self.session_id, OutboundMessage::Event(event))
            .await
    }
}

#[derive(Clone)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub request_id: Option<RequestId>,
    pub cancellation: CancellationToken,
    /// Cancelled when the session itself is destroyed.
    pub session_closed: CancellationToken,
    pub notifier: Notifier,
}

impl SessionContext {
    pub fn new(
        registry: &SessionRegistry,
        session: &Session,
        request_id: Option<RequestId>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            session_id: session.id().clone(),
            request_id,
            cancellation,
            session_closed: session.cancellation_token(),
            notifier: Notifier::new(registry.clone(), session.id().clone()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Methods whose streamed replies must keep dispatch order rather than
    /// completion order.
    fn is_order_sensitive(&self, _method: &str) -> bool {
        false
    }

    async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        context: SessionContext,
    ) -> Result<EngineReply, EngineError>;
}
