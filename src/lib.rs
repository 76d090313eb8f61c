use std::{sync::Arc, time::Duration};

use axum::{
    http::{header, HeaderName, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod transport;

use config::{Config, ConfigError};
use domain::messaging::MessagingService;
use mcp::engine::ProtocolEngine;
use transport::{
    dispatcher::Dispatcher, lifecycle::LifecycleController, session::SessionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub dispatcher: Dispatcher,
    pub lifecycle: LifecycleController,
    pub messaging: Arc<MessagingService>,
    pub session_header: HeaderName,
    pub stream_capacity: usize,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        messaging: Arc<MessagingService>,
        session_header: HeaderName,
        stream_capacity: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self::with_registry(
            SessionRegistry::new(),
            engine,
            messaging,
            session_header,
            stream_capacity,
            shutdown_grace,
        )
    }

    pub fn with_registry(
        registry: SessionRegistry,
        engine: Arc<dyn ProtocolEngine>,
        messaging: Arc<MessagingService>,
        session_header: HeaderName,
        stream_capacity: usize,
        shutdown_grace: Duration,
    ) -> Self {
        let lifecycle = LifecycleController::new(registry.clone(), shutdown_grace);
        let dispatcher = Dispatcher::new(registry.clone(), engine, lifecycle.clone());
        Self {
            registry,
            dispatcher,
            lifecycle,
            messaging,
            session_header,
            stream_capacity,
        }
    }

    pub fn from_config(
        config: &Config,
        engine: Arc<dyn ProtocolEngine>,
        messaging: Arc<MessagingService>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(
            engine,
            messaging,
            config.session_header_name()?,
            config.stream_capacity,
            config.shutdown_grace(),
        ))
    }
}

pub fn build_app(state: AppState) -> Router {
    let streamable = Router::new().route(
        "/mcp",
        post(http::handlers::mcp_post)
            .get(http::handlers::mcp_get)
            .delete(http::handlers::mcp_delete),
    );

    let dashboard = Router::new()
        .route(
            "/api/sessions",
            get(http::handlers::messaging_sessions)
                .options(http::handlers::messaging_sessions_options),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        );

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .merge(streamable)
        .merge(dashboard)
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::domain::messaging::MessagingTimeouts;
    use crate::mcp::codec::OutboundMessage;
    use crate::mcp::server::McpServer;
    use crate::transport::session::{SequentialGenerator, SessionId};

    use super::*;

    const SESSION_HEADER: &str = "mcp-session-id";

    fn state() -> AppState {
        let messaging = Arc::new(MessagingService::in_memory(
            None,
            MessagingTimeouts {
                get_messages: Duration::from_secs(5),
                send_and_wait: Duration::from_secs(5),
            },
        ));
        AppState::with_registry(
            SessionRegistry::with_generator(Arc::new(SequentialGenerator::new())),
            Arc::new(McpServer::new(Arc::clone(&messaging))),
            messaging,
            HeaderName::from_static(SESSION_HEADER),
            16,
            Duration::from_millis(200),
        )
    }

    fn get_request(uri: &str, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method("GET");
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        builder.body(Body::empty()).expect("request build")
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        build_app(state.clone())
            .oneshot(request)
            .await
            .expect("request execution")
    }

    async fn post_mcp(state: &AppState, session: Option<&str>, body: &str) -> Response {
        let mut builder = Request::builder()
            .uri("/mcp")
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }
        send(state, builder.body(Body::from(body.to_string())).expect("request build")).await
    }

    fn session_of(response: &Response) -> String {
        response
            .headers()
            .get(SESSION_HEADER)
            .expect("session header")
            .to_str()
            .expect("ascii header")
            .to_string()
    }

    async fn body_bytes(response: Response) -> axum::body::Bytes {
        response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("valid json response")
    }

    async fn next_frame_text(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("frame before timeout")
            .expect("stream still open")
            .expect("frame ok");
        let data = frame.into_data().expect("data frame");
        String::from_utf8(data.to_vec()).expect("utf8 frame")
    }

    fn sse_field<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
        frame
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .map(str::trim)
    }

    async fn open_session(state: &AppState) -> String {
        let response = post_mcp(state, None, r#"{"jsonrpc":"2.0","id":0,"method":"ping"}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        session_of(&response)
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/health")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "{\"status\":\"ok\"}");
    }

    #[tokio::test]
    async fn discovery_names_endpoint_and_session_header() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/.well-known/mcp")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        assert_eq!(body_json["mcp_endpoint"], "/mcp");
        assert_eq!(body_json["session_header"], SESSION_HEADER);
    }

    #[tokio::test]
    async fn root_get_is_not_found() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ping_without_session_creates_one() {
        let state = state();
        let response = post_mcp(&state, None, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;

        assert_eq!(response.status(), StatusCode::OK);
        let session = session_of(&response);
        assert_eq!(session, "seq-1");
        assert_eq!(state.registry.len(), 1);
        assert_eq!(
            body_json(response).await,
            json!({"jsonrpc": "2.0", "id": 1, "result": "pong"})
        );
    }

    #[tokio::test]
    async fn known_session_is_reused() {
        let state = state();
        let session = open_session(&state).await;

        let response = post_mcp(
            &state,
            Some(&session),
            r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session_of(&response), session);
        assert_eq!(state.registry.len(), 1);
        assert_eq!(body_json(response).await["id"], "abc");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = state();
        let response = post_mcp(
            &state,
            Some("does-not-exist"),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(SESSION_HEADER).is_none());
        assert_eq!(body_json(response).await["error"]["code"], -32001);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let state = state();
        let response = post_mcp(&state, None, "{not json").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body_json = body_json(response).await;
        assert_eq!(body_json["error"]["code"], -32700);
        assert!(body_json["id"].is_null());
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let response = post_mcp(&state(), None, "[]").await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn unknown_method_returns_method_not_found() {
        let response = post_mcp(
            &state(),
            None,
            r#"{"jsonrpc":"2.0","id":1,"method":"unknown"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        assert_eq!(body_json["id"], 1);
        assert_eq!(body_json["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn initialize_returns_negotiated_version() {
        let response = post_mcp(
            &state(),
            None,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","clientInfo":{"name":"test-client","version":"1.0.0"},"capabilities":{}}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        assert_eq!(body_json["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(
            body_json["result"]["serverInfo"]["version"],
            env!("CARGO_PKG_VERSION")
        );
        assert!(body_json["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn batch_replies_in_request_order_without_notifications() {
        let state = state();
        let session = open_session(&state).await;

        let response = post_mcp(
            &state,
            Some(&session),
            r#"[
                {"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"checkin_client","arguments":{"client_id":"ada","name":"Ada"}}},
                {"jsonrpc":"2.0","method":"notifications/initialized"},
                {"jsonrpc":"2.0","id":2,"method":"ping"},
                {"jsonrpc":"2.0","id":3,"method":"tools/list","params":{}}
            ]"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body_json = body_json(response).await;
        let replies = body_json.as_array().expect("batch reply");
        let ids: Vec<&Value> = replies.iter().map(|reply| &reply["id"]).collect();
        assert_eq!(ids, vec![&json!(1), &json!(2), &json!(3)]);
        assert!(replies[0]["result"]["content"][0]["text"]
            .as_str()
            .expect("text")
            .starts_with("👋 **Checked in successfully** as `ada`"));
        assert_eq!(replies[1]["result"], "pong");
    }

    #[tokio::test]
    async fn notification_only_is_accepted_without_body() {
        let state = state();
        let session = open_session(&state).await;

        let response = post_mcp(
            &state,
            Some(&session),
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(session_of(&response), session);
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn get_without_session_opens_stream_for_new_session() {
        let state = state();
        let response = send(
            &state,
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).expect("content type"),
            "text/event-stream"
        );
        let session = session_of(&response);
        let mut body = response.into_body();
        let opening = next_frame_text(&mut body).await;
        assert_eq!(sse_field(&opening, "event"), Some("session"));
        assert!(opening.contains(&session));
    }

    #[tokio::test]
    async fn get_with_unknown_session_is_not_found() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .header(SESSION_HEADER, "does-not-exist")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deferred_reply_is_delivered_on_attached_stream() {
        let state = state();
        let session = open_session(&state).await;

        let stream_response = send(
            &state,
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .header(SESSION_HEADER, session.as_str())
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        assert_eq!(stream_response.status(), StatusCode::OK);
        let mut stream_body = stream_response.into_body();
        let opening = next_frame_text(&mut stream_body).await;
        assert_eq!(sse_field(&opening, "event"), Some("session"));

        let response = post_mcp(
            &state,
            Some(&session),
            r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"get_my_identity","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let frame = next_frame_text(&mut stream_body).await;
        assert_eq!(sse_field(&frame, "event"), Some("message"));
        assert_eq!(sse_field(&frame, "id"), Some("1"));
        assert!(frame.contains("Your Messaging Identity"));
        assert!(frame.contains("\"id\":7"));
    }

    #[tokio::test]
    async fn waiting_get_messages_is_answered_on_the_stream_when_mail_arrives() {
        let state = state();
        let reader = open_session(&state).await;
        let writer = open_session(&state).await;

        let stream_response = send(&state, get_request("/mcp", Some(&reader))).await;
        let mut stream_body = stream_response.into_body();
        next_frame_text(&mut stream_body).await;

        let messaging = Arc::clone(&state.messaging);
        let waiting = {
            let state = state.clone();
            let reader = reader.clone();
            tokio::spawn(async move {
                post_mcp(
                    &state,
                    Some(&reader),
                    r#"{"jsonrpc":"2.0","id":"inbox","method":"tools/call","params":{"name":"get_messages","arguments":{"sender_id":"bob"}}}"#,
                )
                .await
            })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while messaging.backend().stats().await.active_waiters == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reader parked");

        let response = post_mcp(
            &state,
            Some(&writer),
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"send_message_without_waiting","arguments":{"sender_id":"alice","recipients":[{"id":"bob","message":"lunch?"}]}}}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(waiting.await.expect("join").status(), StatusCode::ACCEPTED);
        let mut frame = next_frame_text(&mut stream_body).await;
        while sse_field(&frame, "event") != Some("message") || !frame.contains("inbox") {
            frame = next_frame_text(&mut stream_body).await;
        }
        assert!(frame.contains("lunch?"));
    }

    #[tokio::test]
    async fn immediate_reply_stays_inline_with_stream_attached() {
        let state = state();
        let session = open_session(&state).await;

        let stream_response = send(
            &state,
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .header(SESSION_HEADER, session.as_str())
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        let _stream_body = stream_response.into_body();

        let response = post_mcp(
            &state,
            Some(&session),
            r#"{"jsonrpc":"2.0","id":8,"method":"ping"}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["result"], "pong");
    }

    #[tokio::test]
    async fn delete_closes_session_once() {
        let state = state();
        let session = open_session(&state).await;

        let delete = |session: String| {
            Request::builder()
                .uri("/mcp")
                .method("DELETE")
                .header(SESSION_HEADER, session)
                .body(Body::empty())
                .expect("request build")
        };

        let response = send(&state, delete(session.clone())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.registry.is_empty());

        let response = send(&state, delete(session.clone())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = post_mcp(
            &state,
            Some(&session),
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_without_session_header_is_bad_request() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/mcp")
                .method("DELETE")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_unavailable() {
        let state = state();
        open_session(&state).await;

        let report = state.lifecycle.shutdown().await;
        assert_eq!(report.sessions_destroyed, 1);
        assert!(!report.grace_expired);

        let response = post_mcp(&state, None, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"]["code"], -32002);

        let response = send(
            &state,
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn api_sessions_reports_clients_with_cors() {
        let state = state();
        post_mcp(
            &state,
            None,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"send_message_without_waiting","arguments":{"sender_id":"alice","recipients":[{"id":"bob","message":"hi"}],"recipients_config":{"my_sender_id":"alice","my_name":"Alice"}}}}"#,
        )
        .await;

        let response = send(
            &state,
            Request::builder()
                .uri("/api/sessions")
                .method("GET")
                .header(header::ORIGIN, "http://dashboard.local")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .expect("cors header"),
            "*"
        );
        let body_json = body_json(response).await;
        assert_eq!(body_json["total_messages"], 1);
        assert_eq!(body_json["queueStats"]["total_queues"], 1);
        let clients = body_json["messagingClients"].as_array().expect("clients");
        assert_eq!(clients[0]["client_id"], "bob");
        assert_eq!(clients[0]["clientType"], "untracked client");
        assert_eq!(clients[1]["client_id"], "alice");
        assert_eq!(clients[1]["name"], "Alice");
    }

    #[tokio::test]
    async fn api_sessions_answers_preflight() {
        let response = send(
            &state(),
            Request::builder()
                .uri("/api/sessions")
                .method("OPTIONS")
                .header(header::ORIGIN, "http://dashboard.local")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let methods = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_METHODS)
            .expect("allowed methods")
            .to_str()
            .expect("ascii");
        assert!(methods.contains("GET"));
        assert!(methods.contains("OPTIONS"));
    }

    #[tokio::test]
    async fn streamed_reply_survives_shutdown() {
        let state = state();
        let response = send(&state, get_request("/mcp", None)).await;
        let session = SessionId::from(session_of(&response));
        let mut body = response.into_body();
        next_frame_text(&mut body).await;

        state
            .registry
            .publish(
                &session,
                OutboundMessage::Event(json!({"jsonrpc": "2.0", "method": "notifications/progress"})),
            )
            .await
            .expect("publish");

        let shutdown = {
            let lifecycle = state.lifecycle.clone();
            tokio::spawn(async move { lifecycle.shutdown().await })
        };

        let frame = next_frame_text(&mut body).await;
        assert!(frame.contains("notifications/progress"));
        let end = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("stream ends before timeout");
        assert!(end.is_none());

        let report = shutdown.await.expect("join");
        assert!(!report.grace_expired);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn get_after_registry_closed_is_unavailable_and_creates_nothing() {
        let state = state();
        state.registry.stop_accepting();

        let response = send(&state, get_request("/mcp", None)).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_ends_open_streams() {
        let state = state();
        let response = send(
            &state,
            Request::builder()
                .uri("/mcp")
                .method("GET")
                .body(Body::empty())
                .expect("request build"),
        )
        .await;
        let mut body = response.into_body();
        next_frame_text(&mut body).await;

        let report = state.lifecycle.shutdown().await;
        assert_eq!(report.streams_drained, 1);

        let end = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("stream ends before timeout");
        assert!(end.is_none());
    }
}
