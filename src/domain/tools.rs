//! Messaging tools offered by the built-in engine
//!
//! `get_messages` and `send_message_and_wait` may park for a long time; their
//! results are deferred so they land on the caller's stream when one is
//! attached.

use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::clients::{ClientProfile, DEFAULT_CLIENT_TYPE};
use crate::domain::messaging::{MessagingService, WaitCancelled};
use crate::domain::notifications::{LogLevel, LogSink};
use crate::mcp::engine::{EngineError, EngineReply, SessionContext};

pub const DEFAULT_CAPABILITIES: &str = "Generic project description";

const IDENTITY_GUIDE: &str = r#"## 🆔 Your Messaging Identity & Recipients

## Your Configuration
Please check your local `mcp_recipients.json` file in your project root folder for:
- **Your sender ID** (my_sender_id field) - This is YOUR unique identifier
- **Available recipients** (recipients section) - These are the IDs you can send messages to

## Local File Location
Look for `mcp_recipients.json` in your project directory.

## Usage
Use your my_sender_id for all messaging operations. This is YOUR unique identifier that
distinguishes you from other senders and recipients.

## Example mcp_recipients.json
```json
{
    "my_sender_id": "your_unique_id_here",
    "recipients": {
        "recipient1_id": {
            "name": "Recipient 1",
            "description": "Description of recipient 1"
        }
    }
}
```

Remember: Always use your my_sender_id from this file - do not generate arbitrary IDs."#;

/// Identity block from the caller's `mcp_recipients.json`.
#[derive(Debug, Default, Deserialize, Serialize, macros::JsonSchema)]
pub struct RecipientsConfig {
    /// Your own sender id
    pub my_sender_id: Option<String>,
    pub my_name: Option<String>,
    pub my_description: Option<String>,
    #[serde(rename = "clientType")]
    pub client_type: Option<String>,
}

impl RecipientsConfig {
    fn profile(&self) -> Option<ClientProfile> {
        let client_id = self.my_sender_id.as_deref()?.trim();
        if client_id.is_empty() {
            return None;
        }

        Some(ClientProfile {
            client_id: client_id.to_string(),
            name: self.my_name.clone().unwrap_or_else(|| client_id.to_string()),
            description: self.my_description.clone().unwrap_or_default(),
            client_type: self
                .client_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CLIENT_TYPE.to_string()),
        })
    }
}

#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct RecipientMessage {
    /// Recipient id from your `recipients` section
    pub id: String,
    pub message: String,
}

#[macros::mcp_tool(
    name = "checkin_client",
    description = "Check in as a client to announce your presence. Use the my_sender_id and my_name values from your mcp_recipients.json file."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct CheckinClientTool {
    /// Your unique sender id (`my_sender_id`)
    pub client_id: String,
    /// Display name (`my_name`)
    pub name: String,
    pub capabilities: Option<String>,
}

#[macros::mcp_tool(
    name = "send_message_without_waiting",
    description = "Send messages to one or more recipients instantly (fire and forget), then return any messages already waiting for you. Call get_messages later to check for replies."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SendMessageWithoutWaitingTool {
    pub sender_id: String,
    pub recipients: Vec<RecipientMessage>,
    pub recipients_config: Option<RecipientsConfig>,
}

#[macros::mcp_tool(
    name = "get_messages",
    description = "Get pending messages for this sender. Waits up to the configured timeout when none are queued."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetMessagesTool {
    pub sender_id: String,
    pub recipients_config: Option<RecipientsConfig>,
}

#[macros::mcp_tool(
    name = "get_my_identity",
    description = "Explain where to find your sender id and available recipients."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetMyIdentityTool {
    pub recipients_config: Option<RecipientsConfig>,
}

#[macros::mcp_tool(
    name = "send_message_and_wait",
    description = "Send a message and block until a reply arrives or the wait times out. Prefer send_message_without_waiting."
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SendMessageAndWaitTool {
    pub sender_id: String,
    pub recipient_id: String,
    pub message: String,
    /// One of `response_expected` (default), `no_response`, `end_conversation`
    pub expectation: Option<String>,
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![
        CheckinClientTool::tool(),
        SendMessageWithoutWaitingTool::tool(),
        GetMessagesTool::tool(),
        GetMyIdentityTool::tool(),
        SendMessageAndWaitTool::tool(),
    ]
}

pub async fn handle_tools_call(
    messaging: &MessagingService,
    sink: &LogSink,
    params: Option<Value>,
    context: SessionContext,
) -> Result<EngineReply, EngineError> {
    let raw_params = params.ok_or_else(|| EngineError::InvalidParams("params are required".into()))?;
    let tool_call: CallToolRequestParams = serde_json::from_value(raw_params)
        .map_err(|err| EngineError::InvalidParams(err.to_string()))?;
    let arguments = Value::Object(tool_call.arguments.unwrap_or_default());

    let text = match tool_call.name.as_str() {
        "checkin_client" => {
            let args: CheckinClientTool = parse_arguments(arguments)?;
            let capabilities = args.capabilities.as_deref().unwrap_or(DEFAULT_CAPABILITIES);
            messaging
                .checkin_client(&args.client_id, &args.name, capabilities)
                .await
        }
        "send_message_without_waiting" => {
            let args: SendMessageWithoutWaitingTool = parse_arguments(arguments)?;
            record(messaging, args.recipients_config.as_ref()).await;
            let deliveries: Vec<(String, String)> = args
                .recipients
                .into_iter()
                .map(|recipient| (recipient.id, recipient.message))
                .collect();
            messaging
                .send_without_waiting(&args.sender_id, &deliveries)
                .await
        }
        "get_messages" => {
            let args: GetMessagesTool = parse_arguments(arguments)?;
            record(messaging, args.recipients_config.as_ref()).await;
            sink.emit(
                &context,
                LogLevel::Debug,
                json!(format!("Checking messages for {}", args.sender_id)),
            )
            .await;
            messaging
                .get_messages(&args.sender_id, &context.cancellation)
                .await
                .map_err(cancelled)?
        }
        "get_my_identity" => {
            let args: GetMyIdentityTool = parse_arguments(arguments)?;
            record(messaging, args.recipients_config.as_ref()).await;
            IDENTITY_GUIDE.to_string()
        }
        "send_message_and_wait" => {
            let args: SendMessageAndWaitTool = parse_arguments(arguments)?;
            send_and_wait(messaging, sink, &context, args).await?
        }
        other => {
            return Err(EngineError::InvalidParams(format!("unknown tool: {other}")));
        }
    };

    Ok(EngineReply::deferred(text_result(text)))
}

fn parse_arguments<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, EngineError> {
    serde_json::from_value(arguments).map_err(|err| EngineError::InvalidParams(err.to_string()))
}

fn text_result(text: String) -> Value {
    serde_json::to_value(CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: None,
        meta: None,
        structured_content: None,
    })
    .expect("tool result serialization")
}

fn cancelled(_: WaitCancelled) -> EngineError {
    EngineError::Cancelled
}

async fn record(messaging: &MessagingService, config: Option<&RecipientsConfig>) {
    if let Some(profile) = config.and_then(RecipientsConfig::profile) {
        messaging.record_activity(profile).await;
    }
}

fn expectation_footer(expectation: &str) -> &'static str {
    match expectation {
        "no_response" => "**📭 I do not expect a response**",
        "end_conversation" => "**🔚 End of conversation**",
        _ => "**📬 I expect a response via send_message_and_wait**",
    }
}

async fn send_and_wait(
    messaging: &MessagingService,
    sink: &LogSink,
    context: &SessionContext,
    args: SendMessageAndWaitTool,
) -> Result<String, EngineError> {
    let expectation = args.expectation.as_deref().unwrap_or("response_expected");
    let content = format!("{}\n\n---\n{}", args.message, expectation_footer(expectation));

    if expectation == "no_response" {
        let outcome = match messaging
            .send_message(&args.sender_id, &args.recipient_id, &content)
            .await
        {
            Ok(()) => format!("✅ **Message sent successfully** to `{}`", args.recipient_id),
            Err(rejection) => rejection.to_string(),
        };
        return Ok(format!("📭 **Message sent** (no response expected)\n\n{outcome}"));
    }

    sink.emit(
        context,
        LogLevel::Info,
        json!(format!("Waiting for a reply from {}", args.recipient_id)),
    )
    .await;
    messaging
        .send_and_wait(&args.sender_id, &args.recipient_id, &content, &context.cancellation)
        .await
        .map_err(cancelled)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::domain::messaging::MessagingTimeouts;
    use crate::mcp::codec::OutboundMessage;
    use crate::transport::session::SessionRegistry;
    use crate::transport::stream::StreamHandle;

    fn messaging(wait_ms: u64) -> MessagingService {
        MessagingService::in_memory(
            None,
            MessagingTimeouts {
                get_messages: Duration::from_millis(wait_ms),
                send_and_wait: Duration::from_millis(wait_ms),
            },
        )
    }

    fn call(name: &str, arguments: Value) -> Option<Value> {
        Some(json!({ "name": name, "arguments": arguments }))
    }

    fn context(registry: &SessionRegistry) -> SessionContext {
        let session = registry.create_session().expect("session");
        SessionContext::new(registry, &session, None, CancellationToken::new())
    }

    fn text_of(reply: &EngineReply) -> &str {
        reply.value["content"][0]["text"].as_str().expect("text content")
    }

    #[test]
    fn lists_all_tools() {
        let names: Vec<String> = build_tools_list().into_iter().map(|tool| tool.name).collect();
        assert_eq!(
            names,
            vec![
                "checkin_client",
                "send_message_without_waiting",
                "get_messages",
                "get_my_identity",
                "send_message_and_wait"
            ]
        );
    }

    #[test]
    fn recipient_list_schema_describes_nested_objects() {
        let tool = SendMessageWithoutWaitingTool::tool();
        let schema = serde_json::to_value(&tool.input_schema).expect("schema json");
        let items = &schema["properties"]["recipients"]["items"];
        assert_eq!(items["type"], "object");
        assert!(items["properties"]["message"].is_object());
    }

    #[tokio::test]
    async fn checkin_defaults_capabilities() {
        let registry = SessionRegistry::new();
        let messaging = messaging(10);

        let reply = handle_tools_call(
            &messaging,
            &LogSink::default(),
            call("checkin_client", json!({"client_id": "alice", "name": "Alice"})),
            context(&registry),
        )
        .await
        .expect("checkin");

        assert!(!reply.immediate);
        assert!(text_of(&reply).ends_with(&format!("**Capabilities:** {DEFAULT_CAPABILITIES}")));
    }

    #[tokio::test]
    async fn sent_messages_are_collected_by_recipient() {
        let registry = SessionRegistry::new();
        let messaging = messaging(10);
        let sink = LogSink::default();

        let reply = handle_tools_call(
            &messaging,
            &sink,
            call(
                "send_message_without_waiting",
                json!({
                    "sender_id": "alice",
                    "recipients": [{"id": "bob", "message": "Review code"}],
                    "recipients_config": {"my_sender_id": "alice", "clientType": "cli"}
                }),
            ),
            context(&registry),
        )
        .await
        .expect("send");
        assert!(text_of(&reply).contains("(1/1 successful)"));

        let reply = handle_tools_call(
            &messaging,
            &sink,
            call("get_messages", json!({"sender_id": "bob"})),
            context(&registry),
        )
        .await
        .expect("get");
        assert!(text_of(&reply).contains("**From:** `alice` (just now)\nReview code"));

        let report = messaging.activity_report().await;
        assert_eq!(report.messaging_clients[0].client_id, "alice");
        assert_eq!(report.messaging_clients[0].client_type, "cli");
    }

    #[tokio::test]
    async fn get_messages_logs_to_the_callers_stream() {
        let registry = SessionRegistry::new();
        let context = context(&registry);
        let (stream, mut rx) = StreamHandle::open(context.session_id.clone(), 8);
        registry
            .attach_stream(&context.session_id, Arc::clone(&stream))
            .expect("attach");

        handle_tools_call(
            &messaging(10),
            &LogSink::default(),
            call("get_messages", json!({"sender_id": "bob"})),
            context,
        )
        .await
        .expect("get");

        let Some(OutboundMessage::Event(event)) = rx.next_message().await else {
            panic!("expected event");
        };
        assert_eq!(event["method"], "notifications/message");
        assert_eq!(event["params"]["data"], "Checking messages for bob");
    }

    #[tokio::test]
    async fn get_messages_stops_when_cancelled() {
        let registry = SessionRegistry::new();
        let context = context(&registry);
        context.cancellation.cancel();

        let err = handle_tools_call(
            &messaging(5_000),
            &LogSink::default(),
            call("get_messages", json!({"sender_id": "bob"})),
            context,
        )
        .await
        .expect_err("cancelled");
        assert_eq!(err, EngineError::Cancelled);
    }

    #[tokio::test]
    async fn send_and_wait_without_reply_expected_returns_at_once() {
        let registry = SessionRegistry::new();
        let messaging = messaging(5_000);

        let reply = handle_tools_call(
            &messaging,
            &LogSink::default(),
            call(
                "send_message_and_wait",
                json!({
                    "sender_id": "alice",
                    "recipient_id": "bob",
                    "message": "FYI",
                    "expectation": "no_response"
                }),
            ),
            context(&registry),
        )
        .await
        .expect("send");
        assert!(text_of(&reply).starts_with("📭 **Message sent** (no response expected)"));

        let queued = messaging.backend().get_messages("bob", true).await;
        assert_eq!(queued[0].content, "FYI\n\n---\n**📭 I do not expect a response**");
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments_are_invalid_params() {
        let registry = SessionRegistry::new();
        let messaging = messaging(10);
        let sink = LogSink::default();

        let err = handle_tools_call(&messaging, &sink, call("nope", json!({})), context(&registry))
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, EngineError::InvalidParams(_)));

        let err = handle_tools_call(
            &messaging,
            &sink,
            call("send_message_without_waiting", json!({"sender_id": "alice"})),
            context(&registry),
        )
        .await
        .expect_err("missing recipients");
        assert!(matches!(err, EngineError::InvalidParams(_)));

        let err = handle_tools_call(&messaging, &sink, None, context(&registry))
            .await
            .expect_err("missing params");
        assert!(matches!(err, EngineError::InvalidParams(_)));
    }
}
