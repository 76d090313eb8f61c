//! Built-in protocol engine
//!
//! Provides `initialize` negotiation, `ping`, the messaging tools and the
//! logging capability.

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ListToolsResult, ServerCapabilities, ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::info;

use crate::domain::messaging::MessagingService;
use crate::domain::notifications::{LogSink, SetLevelParams};
use crate::domain::tools::{build_tools_list, handle_tools_call};
use crate::mcp::engine::{
    Capabilities, EngineError, EngineReply, ProtocolEngine, SessionContext,
};

/// Newest first; an unknown offer is answered with the newest.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 2] = ["2025-03-26", "2024-11-05"];

pub struct McpServer {
    messaging: Arc<MessagingService>,
    log_sink: LogSink,
}

impl McpServer {
    pub fn new(messaging: Arc<MessagingService>) -> Self {
        Self {
            messaging,
            log_sink: LogSink::default(),
        }
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    fn initialize(&self, params: Option<&Value>) -> Result<Value, EngineError> {
        let protocol_version = negotiate_protocol_version(params)?;
        let capabilities = self.capabilities();

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: capabilities.tools.then_some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                logging: capabilities.logging.then(serde_json::Map::new),
                ..Default::default()
            },
            protocol_version: protocol_version.to_string(),
            instructions: None,
            meta: None,
        };

        Ok(serde_json::to_value(initialize_result).expect("initialize result serialization"))
    }
}

#[async_trait]
impl ProtocolEngine for McpServer {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            tools: true,
            logging: true,
        }
    }

    async fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
        context: SessionContext,
    ) -> Result<EngineReply, EngineError> {
        let audit_params = redact_audit_params(params.as_ref());

        let result = match method {
            "initialize" => self.initialize(params.as_ref()).map(EngineReply::immediate),
            "ping" => Ok(EngineReply::immediate(json!("pong"))),
            "tools/list" => Ok(EngineReply::immediate(
                serde_json::to_value(ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: build_tools_list(),
                })
                .expect("tools list result serialization"),
            )),
            "tools/call" => {
                handle_tools_call(&self.messaging, &self.log_sink, params, context.clone()).await
            }
            "logging/setLevel" => serde_json::from_value::<SetLevelParams>(
                params.unwrap_or(Value::Null),
            )
            .map_err(|err| EngineError::InvalidParams(err.to_string()))
            .map(|request| {
                self.log_sink.set_level(&context, request.level);
                EngineReply::immediate(json!({}))
            }),
            "notifications/initialized" | "notifications/cancelled" => {
                Ok(EngineReply::immediate(Value::Null))
            }
            other => Err(EngineError::MethodNotFound(other.to_string())),
        };

        info!(
            session_id = %context.session_id,
            method = %method,
            params = %audit_params,
            outcome = if result.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        result
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<&'static str, EngineError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            EngineError::InvalidParams("initialize params.protocolVersion is required".to_string())
        })?;

    Ok(SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|version| *version == offered_version)
        .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]))
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
        || matches!(normalized.as_str(), "authorization" | "api_key" | "apikey")
}
