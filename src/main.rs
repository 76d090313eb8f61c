use std::sync::Arc;

use mcp_streamable_http::{
    build_app,
    config::{Config, ConfigError},
    domain::messaging::MessagingService,
    errors::TransportError,
    logging,
    mcp::{engine::ProtocolEngine, server::McpServer},
    transport::lifecycle::LifecycleController,
    AppState,
};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = match Config::try_from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(ConfigError::Cli(err)) => err.exit(),
        Err(err) => return Err(err.into()),
    };
    let messaging = Arc::new(MessagingService::in_memory(
        config.message_expiration(),
        config.messaging_timeouts(),
    ));
    let engine = Arc::new(McpServer::new(Arc::clone(&messaging)));
    let capabilities = engine.capabilities();
    let state = AppState::from_config(&config, engine, messaging)?;
    let bind_socket = config.bind_socket()?;
    let lifecycle = state.lifecycle.clone();
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(bind_socket)
        .await
        .map_err(|err| TransportError::Fatal(format!("failed to bind {bind_socket}: {err}")))?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.port,
        session_header = %config.session_header,
        message_expiration_secs = config.message_expiration_secs,
        tools = capabilities.tools,
        logging = capabilities.logging,
        "server starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(lifecycle))
        .await
        .map_err(|err| TransportError::Fatal(format!("server error: {err}")))?;

    info!("server stopped");
    Ok(())
}

/// Resolves once the transport has drained and destroyed every session, so
/// axum only has already-finished streams left to close.
async fn shutdown_signal(lifecycle: LifecycleController) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }

    let report = lifecycle.shutdown().await;
    info!(
        streams_drained = report.streams_drained,
        sessions_destroyed = report.sessions_destroyed,
        grace_expired = report.grace_expired,
        "transport drained"
    );
}
