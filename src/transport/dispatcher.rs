//! Request dispatcher
//!
//! Resolves the session, runs each request on the engine in its own task and
//! decides per reply whether it goes back on the POST response or onto the
//! session's attached stream. Engine calls outlive an aborted POST; only the
//! inline reply is discarded then.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::TransportError;
use crate::mcp::codec::{
    InboundItem, InboundMessage, Notification, OutboundMessage, Request, RequestId, Response,
};
use crate::mcp::engine::{EngineError, ProtocolEngine, SessionContext};
use crate::mcp::rpc::{engine_error_to_response, is_error_response, INTERNAL_ERROR};
use crate::transport::lifecycle::LifecycleController;
use crate::transport::session::{Session, SessionId, SessionRegistry};
use crate::transport::stream::StreamSlot;

pub const CANCELLED_NOTIFICATION: &str = "notifications/cancelled";

/// Replies that belong in the POST response body.
#[derive(Debug, Clone, PartialEq)]
pub enum InlineReply {
    /// Nothing to return inline: notifications only, or every reply streamed.
    None,
    Single(Response),
    Batch(Vec<Response>),
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub session_id: SessionId,
    pub session_created: bool,
    pub reply: InlineReply,
}

enum Delivery {
    Inline(Response),
    Streamed,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    engine: Arc<dyn ProtocolEngine>,
    lifecycle: LifecycleController,
}

impl Dispatcher {
    pub fn new(
        registry: SessionRegistry,
        engine: Arc<dyn ProtocolEngine>,
        lifecycle: LifecycleController,
    ) -> Self {
        Self {
            registry,
            engine,
            lifecycle,
        }
    }

    /// Looks up a client-supplied session or creates a fresh one. Unknown ids
    /// are never adopted.
    pub fn resolve_session(
        &self,
        supplied: Option<&SessionId>,
    ) -> Result<(Arc<Session>, bool), TransportError> {
        match supplied {
            Some(id) => Ok((self.registry.lookup(id)?, false)),
            None => Ok((self.registry.create_session()?, true)),
        }
    }

    pub async fn dispatch(
        &self,
        message: InboundMessage,
        supplied: Option<&SessionId>,
    ) -> Result<DispatchOutcome, TransportError> {
        let _accepting = self.lifecycle.begin()?;
        let (session, session_created) = self.resolve_session(supplied)?;

        match self.run_items(&session, message).await {
            Ok(reply) => Ok(DispatchOutcome {
                session_id: session.id().clone(),
                session_created,
                reply,
            }),
            Err(err) => {
                // The client never received this id.
                if session_created && self.registry.destroy(session.id()) {
                    debug!(
                        session_id = %session.id(),
                        error = %err,
                        "discarded session created by failed request"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_items(
        &self,
        session: &Arc<Session>,
        message: InboundMessage,
    ) -> Result<InlineReply, TransportError> {
        let is_batch = message.is_batch();

        let mut handles: Vec<JoinHandle<Result<Delivery, TransportError>>> = Vec::new();
        for item in message.into_items() {
            match item {
                InboundItem::Request(request) => {
                    handles.push(self.spawn_request(session, request).await?);
                }
                InboundItem::Notification(notification) => {
                    self.fire_notification(session, notification)?;
                }
                InboundItem::Invalid { id, error } => {
                    let response = Response::error(id, error.code(), error.message());
                    handles.push(tokio::spawn(async move { Ok(Delivery::Inline(response)) }));
                }
                InboundItem::Response(id) => {
                    debug!(
                        session_id = %session.id(),
                        request_id = ?id,
                        "ignoring client response to unknown server request"
                    );
                }
            }
        }

        let mut inline = Vec::new();
        for joined in join_all(handles).await {
            let delivery = match joined {
                Ok(delivery) => delivery?,
                Err(err) => {
                    warn!(session_id = %session.id(), error = %err, "request task failed");
                    Delivery::Inline(Response::error(None, INTERNAL_ERROR, "Internal error"))
                }
            };
            if let Delivery::Inline(response) = delivery {
                inline.push(response);
            }
        }

        Ok(match (is_batch, inline.len()) {
            (_, 0) => InlineReply::None,
            (false, _) => InlineReply::Single(inline.remove(0)),
            (true, _) => InlineReply::Batch(inline),
        })
    }

    async fn spawn_request(
        &self,
        session: &Arc<Session>,
        request: Request,
    ) -> Result<JoinHandle<Result<Delivery, TransportError>>, TransportError> {
        let in_flight = self.lifecycle.begin()?;
        let pending = session.begin_request(&request.id);

        let stream = session.stream();
        let slot = match &stream {
            Some(stream) if self.engine.is_order_sensitive(&request.method) => {
                stream.reserve_slot().await.ok()
            }
            _ => None,
        };

        let context = SessionContext::new(
            &self.registry,
            session,
            Some(request.id.clone()),
            pending.token(),
        );
        let engine = Arc::clone(&self.engine);
        let registry = self.registry.clone();
        let session = Arc::clone(session);
        let streamed = stream.is_some();

        Ok(tokio::spawn(async move {
            let _in_flight = in_flight;
            let _pending = pending;
            let Request { id, method, params } = request;

            let result = engine.invoke(&method, params, context).await;
            let (response, immediate) = match result {
                Ok(reply) => (Response::result(Some(id.clone()), reply.value), reply.immediate),
                Err(EngineError::Unavailable(reason)) => {
                    return Err(TransportError::EngineUnavailable(reason));
                }
                Err(err) => (engine_error_to_response(Some(id.clone()), &err), true),
            };

            info!(
                session_id = %session.id(),
                request_id = %id,
                method = %method,
                outcome = if is_error_response(&response) { "failure" } else { "success" },
                "request dispatched"
            );

            if !streamed || immediate {
                return Ok(Delivery::Inline(response));
            }

            deliver_to_stream(&registry, &session, slot, response).await
        }))
    }

    fn fire_notification(
        &self,
        session: &Arc<Session>,
        notification: Notification,
    ) -> Result<(), TransportError> {
        let in_flight = self.lifecycle.begin()?;

        if notification.method == CANCELLED_NOTIFICATION {
            if let Some(request_id) = cancelled_request_id(notification.params.as_ref()) {
                let found = session.cancel_request(&request_id);
                debug!(
                    session_id = %session.id(),
                    request_id = %request_id,
                    found,
                    "cancellation forwarded"
                );
            }
        }

        let context =
            SessionContext::new(&self.registry, session, None, session.cancellation_token());
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let Notification { method, params } = notification;
            if let Err(err) = engine.invoke(&method, params, context).await {
                debug!(method = %method, error = %err, "notification handler failed");
            }
        });
        Ok(())
    }
}

/// Pushes a reply onto the stream that was attached at dispatch time. If that
/// stream went away in the meantime the reply falls back to the POST body.
async fn deliver_to_stream(
    registry: &SessionRegistry,
    session: &Arc<Session>,
    slot: Option<StreamSlot>,
    response: Response,
) -> Result<Delivery, TransportError> {
    if session.is_closed() || registry.lookup(session.id()).is_err() {
        warn!(session_id = %session.id(), "session closed before delivery");
        return Ok(Delivery::Inline(response));
    }

    let message = OutboundMessage::Response(response.clone());
    if let Some(slot) = slot {
        if slot.fill(message.clone()).is_ok() {
            return Ok(Delivery::Streamed);
        }
    }

    let Some(stream) = session.stream() else {
        return Ok(Delivery::Inline(response));
    };

    let pushed = tokio::select! {
        biased;
        _ = session.closed() => Err(TransportError::SessionClosed),
        pushed = stream.push(message) => pushed,
    };

    match pushed {
        Ok(()) => Ok(Delivery::Streamed),
        Err(err) => {
            warn!(session_id = %session.id(), error = %err, "stream delivery failed, replying inline");
            Ok(Delivery::Inline(response))
        }
    }
}

fn cancelled_request_id(params: Option<&Value>) -> Option<RequestId> {
    params
        .and_then(|params| params.get("requestId"))
        .and_then(RequestId::from_value)
}
