//! Logging notifications (`notifications/message`) sent to clients

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::mcp::codec::notification_event;
use crate::mcp::engine::SessionContext;
use crate::transport::session::SessionId;

pub const LOGGING_NOTIFICATION: &str = "notifications/message";

/// Syslog severities, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[derive(Debug, Deserialize)]
pub struct SetLevelParams {
    pub level: LogLevel,
}

/// Filters and forwards log notifications produced by tools. Each session
/// sets its own threshold; sessions that never called `logging/setLevel`
/// get the default.
#[derive(Debug)]
pub struct LogSink {
    default_level: LogLevel,
    levels: Arc<Mutex<HashMap<SessionId, LogLevel>>>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl LogSink {
    pub fn new(default_level: LogLevel) -> Self {
        Self {
            default_level,
            levels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Must run inside a tokio runtime: the entry is dropped by a task that
    /// waits for the session to close.
    pub fn set_level(&self, context: &SessionContext, level: LogLevel) {
        let first = self
            .levels
            .lock()
            .insert(context.session_id.clone(), level)
            .is_none();
        debug!(session_id = %context.session_id, level = ?level, "log level set");

        if first {
            let levels = Arc::clone(&self.levels);
            let session_id = context.session_id.clone();
            let closed = context.session_closed.clone();
            tokio::spawn(async move {
                closed.cancelled().await;
                levels.lock().remove(&session_id);
            });
        }
    }

    pub fn level(&self, session_id: &SessionId) -> LogLevel {
        self.levels
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(self.default_level)
    }

    pub fn tracked_sessions(&self) -> usize {
        self.levels.lock().len()
    }

    /// Returns whether the notification reached the session's stream.
    pub async fn emit(&self, context: &SessionContext, level: LogLevel, data: Value) -> bool {
        if level < self.level(&context.session_id) {
            return false;
        }

        let mut params = Map::new();
        params.insert("level".to_string(), serde_json::json!(level));
        params.insert("data".to_string(), data);
        let event = notification_event(LOGGING_NOTIFICATION, params);

        match context.notifier.send_event(event).await {
            Ok(()) => true,
            Err(err) => {
                debug!(
                    session_id = %context.session_id,
                    error = %err,
                    "log notification not delivered"
                );
                false
            }
        }
    }
}
