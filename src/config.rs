use std::{net::SocketAddr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use thiserror::Error;

use crate::domain::messaging::MessagingTimeouts;

#[derive(Debug, Clone, Parser)]
#[command(name = "mcp-streamable-http", version, about = "MCP streamable HTTP server")]
pub struct Config {
    /// Address to bind the HTTP listener to.
    #[arg(long, env = "MCP_BIND_ADDR", default_value = "127.0.0.1")]
    pub bind_addr: String,

    /// Port to listen on.
    #[arg(long, env = "MCP_PORT", default_value_t = 8123)]
    pub port: u16,

    /// Header carrying the session id in both directions.
    #[arg(long, env = "MCP_SESSION_HEADER", default_value = "mcp-session-id")]
    pub session_header: String,

    /// Upper bound on how long shutdown waits for in-flight requests.
    #[arg(long, env = "MCP_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Messages a stream may queue before pushers wait.
    #[arg(long, env = "MCP_STREAM_CAPACITY", default_value_t = 64)]
    pub stream_capacity: usize,

    /// Age after which undelivered messages are dropped; 0 keeps them.
    #[arg(long, env = "MCP_MESSAGE_EXPIRATION_SECS", default_value_t = 300)]
    pub message_expiration_secs: u64,

    /// How long `get_messages` waits on an empty queue.
    #[arg(long, env = "MCP_GET_MESSAGES_TIMEOUT_SECS", default_value_t = 60)]
    pub get_messages_timeout_secs: u64,

    /// How long `send_message_and_wait` waits for a reply.
    #[arg(long, env = "MCP_SEND_AND_WAIT_TIMEOUT_SECS", default_value_t = 180)]
    pub send_and_wait_timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Cli(#[from] clap::Error),
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_SESSION_HEADER must be a valid HTTP header name")]
    InvalidSessionHeader,
    #[error("MCP_STREAM_CAPACITY must be at least 1")]
    InvalidStreamCapacity,
}

impl Config {
    /// Parses and validates; every problem is reported before anything binds.
    pub fn try_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Self::try_parse_from(args)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_socket()?;
        self.session_header_name()?;
        if self.stream_capacity == 0 {
            return Err(ConfigError::InvalidStreamCapacity);
        }
        Ok(())
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    pub fn session_header_name(&self) -> Result<HeaderName, ConfigError> {
        HeaderName::try_from(self.session_header.trim().to_ascii_lowercase())
            .map_err(|_| ConfigError::InvalidSessionHeader)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn message_expiration(&self) -> Option<Duration> {
        (self.message_expiration_secs > 0).then(|| Duration::from_secs(self.message_expiration_secs))
    }

    pub fn messaging_timeouts(&self) -> MessagingTimeouts {
        MessagingTimeouts {
            get_messages: Duration::from_secs(self.get_messages_timeout_secs),
            send_and_wait: Duration::from_secs(self.send_and_wait_timeout_secs),
        }
    }
}
