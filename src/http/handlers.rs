//! Axum HTTP handlers for the web server
//!
//! Provides the streamable `/mcp` endpoint (POST, GET, DELETE), the
//! messaging overview under `/api/sessions` and the general metadata
//! endpoints.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::clients::ActivityReport;
use crate::errors::TransportError;
use crate::http::sse::sse_response;
use crate::mcp::codec::{decode, encode_batch, encode_value};
use crate::transport::dispatcher::InlineReply;
use crate::transport::session::SessionId;
use crate::transport::stream::StreamHandle;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub mcp_endpoint: &'static str,
    pub session_header: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        mcp_endpoint: "/mcp",
        session_header: state.session_header.as_str().to_string(),
    })
}

/// Messaging clients and queue statistics for dashboards.
pub async fn messaging_sessions(State(state): State<AppState>) -> Json<ActivityReport> {
    Json(state.messaging.activity_report().await)
}

/// Plain `OPTIONS` without preflight headers still gets an empty JSON body.
pub async fn messaging_sessions_options() -> Json<Value> {
    Json(json!({}))
}

/// Reads the session header. Absent is `None`; present but empty or not
/// visible ASCII is rejected.
pub fn session_from_headers(
    headers: &HeaderMap,
    name: &HeaderName,
) -> Result<Option<SessionId>, TransportError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };

    let raw = value
        .to_str()
        .map_err(|_| TransportError::InvalidSessionHeader("not visible ASCII".to_string()))?
        .trim();
    if raw.is_empty() {
        return Err(TransportError::InvalidSessionHeader("empty".to_string()));
    }

    Ok(Some(SessionId::from(raw.to_string())))
}

fn with_session_header(mut response: Response, name: &HeaderName, id: &SessionId) -> Response {
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        response.headers_mut().insert(name.clone(), value);
    }
    response
}

pub async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if !state.lifecycle.is_accepting() {
        return TransportError::ShuttingDown.into_response();
    }

    let supplied = match session_from_headers(&headers, &state.session_header) {
        Ok(supplied) => supplied,
        Err(err) => return err.into_response(),
    };

    let message = match decode(&body) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "rejecting undecodable request body");
            return TransportError::from(err).into_response();
        }
    };

    let outcome = match state.dispatcher.dispatch(message, supplied.as_ref()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let echo = supplied.filter(|_| !matches!(err, TransportError::SessionNotFound));
            let response = err.into_response();
            return match echo {
                Some(id) => with_session_header(response, &state.session_header, &id),
                None => response,
            };
        }
    };

    if outcome.session_created {
        info!(session_id = %outcome.session_id, "session created by request");
    }

    let response = match outcome.reply {
        InlineReply::None => StatusCode::ACCEPTED.into_response(),
        InlineReply::Single(reply) => (StatusCode::OK, Json(encode_value(&reply))).into_response(),
        InlineReply::Batch(replies) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            encode_batch(&replies),
        )
            .into_response(),
    };

    with_session_header(response, &state.session_header, &outcome.session_id)
}

pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let _accepting = match state.lifecycle.begin() {
        Ok(guard) => guard,
        Err(err) => return err.into_response(),
    };

    let supplied = match session_from_headers(&headers, &state.session_header) {
        Ok(supplied) => supplied,
        Err(err) => return err.into_response(),
    };

    let (session, created) = match state.dispatcher.resolve_session(supplied.as_ref()) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };
    let session_id = session.id().clone();

    let (stream, receiver) = StreamHandle::open(session_id.clone(), state.stream_capacity);
    let stream_id = stream.id();
    if let Err(err) = state.registry.attach_stream(&session_id, stream) {
        if created {
            state.registry.destroy(&session_id);
        }
        return err.into_response();
    }
    let receiver = receiver.notify_on_close(state.registry.clone());

    info!(
        session_id = %session_id,
        stream_id,
        session_created = created,
        "event stream opened"
    );

    with_session_header(
        sse_response(&session_id, receiver).into_response(),
        &state.session_header,
        &session_id,
    )
}

pub async fn mcp_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !state.lifecycle.is_accepting() {
        return TransportError::ShuttingDown.into_response();
    }

    let session_id = match session_from_headers(&headers, &state.session_header) {
        Ok(Some(id)) => id,
        Ok(None) => return TransportError::MissingSession.into_response(),
        Err(err) => return err.into_response(),
    };

    if state.registry.destroy(&session_id) {
        info!(session_id = %session_id, "session closed by client");
        StatusCode::NO_CONTENT.into_response()
    } else {
        TransportError::SessionNotFound.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_name() -> HeaderName {
        HeaderName::from_static("mcp-session-id")
    }

    #[test]
    fn absent_session_header_is_none() {
        let headers = HeaderMap::new();
        assert!(matches!(
            session_from_headers(&headers, &header_name()),
            Ok(None)
        ));
    }

    #[test]
    fn session_header_is_trimmed() {
        let mut headers = HeaderMap::new();
        headers.insert(header_name(), HeaderValue::from_static(" abc "));
        let id = session_from_headers(&headers, &header_name())
            .expect("valid header")
            .expect("present");
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn empty_session_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header_name(), HeaderValue::from_static(""));
        assert!(matches!(
            session_from_headers(&headers, &header_name()),
            Err(TransportError::InvalidSessionHeader(_))
        ));
    }
}
