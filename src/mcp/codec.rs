//! Message codec for the `/mcp` endpoint
//!
//! Decodes raw POST bodies into JSON-RPC envelopes (single message or batch)
//! and encodes replies and server-initiated events. Method payloads are not
//! inspected here; that is the engine's job.

use std::collections::HashSet;
use std::fmt;

use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::mcp::rpc::{INVALID_REQUEST, PARSE_ERROR};

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Number),
            Value::String(text) => Some(Self::String(text.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundItem {
    Request(Request),
    Notification(Notification),
    /// A reply the client sent to a server-initiated request.
    Response(Option<RequestId>),
    /// An entry that failed shape validation; answered in place.
    Invalid {
        id: Option<RequestId>,
        error: DecodeError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Single(InboundItem),
    Batch(Vec<InboundItem>),
}

impl InboundMessage {
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Batch(_))
    }

    pub fn into_items(self) -> Vec<InboundItem> {
        match self {
            Self::Single(item) => vec![item],
            Self::Batch(items) => items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("body is not valid JSON")]
    Parse,
    #[error("batch must not be empty")]
    EmptyBatch,
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl DecodeError {
    pub fn code(&self) -> i64 {
        match self {
            Self::Parse => PARSE_ERROR,
            Self::EmptyBatch | Self::InvalidRequest(_) => INVALID_REQUEST,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Parse => "Parse error",
            Self::EmptyBatch | Self::InvalidRequest(_) => "Invalid Request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A reply correlated to a request id (`None` when the id could not be read).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, ErrorObject>,
}

impl Response {
    pub fn result(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self::error_with_data(id, code, message, None)
    }

    pub fn error_with_data(
        id: Option<RequestId>,
        code: i64,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id,
            outcome: Err(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Ok(result) => map.serialize_entry("result", result)?,
            Err(error) => map.serialize_entry("error", error)?,
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Response(Response),
    /// Server-initiated, uncorrelated; only ever written to an attached stream.
    Event(Value),
}

impl From<Response> for OutboundMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

pub fn decode(raw_body: &[u8]) -> Result<InboundMessage, DecodeError> {
    let payload: Value = serde_json::from_slice(raw_body).map_err(|_| DecodeError::Parse)?;

    match payload {
        Value::Array(entries) => {
            if entries.is_empty() {
                return Err(DecodeError::EmptyBatch);
            }

            let mut seen = HashSet::new();
            let items = entries
                .into_iter()
                .map(decode_item)
                .map(|item| match item {
                    InboundItem::Request(request) if !seen.insert(request.id.clone()) => {
                        InboundItem::Invalid {
                            id: None,
                            error: DecodeError::InvalidRequest("duplicate request id in batch"),
                        }
                    }
                    other => other,
                })
                .collect();
            Ok(InboundMessage::Batch(items))
        }
        Value::Object(_) => Ok(InboundMessage::Single(decode_item(payload))),
        _ => Err(DecodeError::InvalidRequest(
            "body must be a JSON object or array",
        )),
    }
}

fn decode_item(value: Value) -> InboundItem {
    let Value::Object(mut object) = value else {
        return invalid(None, "entry must be a JSON object");
    };

    let id = match object.remove("id") {
        None => None,
        Some(raw) => match RequestId::from_value(&raw) {
            Some(id) => Some(id),
            None => return invalid(None, "id must be a string or an integer"),
        },
    };

    if let Some(version) = object.get("jsonrpc") {
        if version.as_str() != Some(JSONRPC_VERSION) {
            return invalid(id, "jsonrpc must be \"2.0\"");
        }
    }

    let Some(method) = object.remove("method") else {
        if object.contains_key("result") || object.contains_key("error") {
            return InboundItem::Response(id);
        }
        return invalid(id, "method is required");
    };

    let method = match method {
        Value::String(method) if !method.trim().is_empty() => method,
        _ => return invalid(id, "method must be a non-empty string"),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(_) => return invalid(id, "params must be an object or an array"),
    };

    match id {
        Some(id) => InboundItem::Request(Request { id, method, params }),
        None => InboundItem::Notification(Notification { method, params }),
    }
}

fn invalid(id: Option<RequestId>, reason: &'static str) -> InboundItem {
    InboundItem::Invalid {
        id,
        error: DecodeError::InvalidRequest(reason),
    }
}

pub fn encode(message: &OutboundMessage) -> Vec<u8> {
    match message {
        OutboundMessage::Response(response) => {
            serde_json::to_vec(response).expect("jsonrpc response serialization")
        }
        OutboundMessage::Event(event) => {
            serde_json::to_vec(event).expect("event serialization")
        }
    }
}

/// Encodes batch replies in the order given, which callers keep equal to
/// the request order of the batch.
pub fn encode_batch(responses: &[Response]) -> Vec<u8> {
    serde_json::to_vec(responses).expect("jsonrpc batch serialization")
}

pub fn encode_value(response: &Response) -> Value {
    serde_json::to_value(response).expect("jsonrpc response serialization")
}

/// Builds a JSON-RPC notification envelope for server-initiated events.
pub fn notification_event(method: &str, params: Map<String, Value>) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}
