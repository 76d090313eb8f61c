//! Client-to-client message queues
//!
//! Each client id owns one FIFO queue. Readers that find their queue empty
//! park on a per-client [`Notify`] until a sender wakes them or their wait
//! times out. Messages older than the configured expiration are swept before
//! every send and read.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::clients::{
    ActivityReport, ClientDirectory, ClientProfile, CHECKED_IN_CLIENT_TYPE,
};

pub const DEFAULT_MESSAGE_EXPIRATION: Duration = Duration::from_secs(300);
pub const DEFAULT_GET_MESSAGES_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_SEND_AND_WAIT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from_client_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(from_client_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from_client_id: from_client_id.into(),
            content: content.into(),
            sent_at: Utc::now(),
        }
    }
}

/// `"3 minutes ago"`, `"1 day ago"`, or `"just now"` under a minute.
pub fn format_relative_time(sent_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now - sent_at;
    let (count, unit) = if elapsed.num_days() > 0 {
        (elapsed.num_days(), "day")
    } else if elapsed.num_hours() > 0 {
        (elapsed.num_hours(), "hour")
    } else if elapsed.num_minutes() > 0 {
        (elapsed.num_minutes(), "minute")
    } else {
        return "just now".to_string();
    };

    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_queues: usize,
    pub total_messages: usize,
    pub active_waiters: usize,
}

/// Storage for per-client queues. Kept async so a networked store can sit
/// behind the same interface.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn send_message(&self, recipient_id: &str, message: Message);

    /// All queued messages for `client_id`, oldest first. `pop` empties the
    /// queue.
    async fn get_messages(&self, client_id: &str, pop: bool) -> Vec<Message>;

    /// Returns how many messages were dropped.
    async fn cleanup_expired_messages(&self) -> usize;

    /// True as soon as the client's queue is non-empty, false on timeout.
    async fn wait_for_new_message(&self, client_id: &str, timeout: Duration) -> bool;

    async fn notify_new_message(&self, client_id: &str);

    async fn stats(&self) -> QueueStats;

    async fn queue_lengths(&self) -> HashMap<String, usize>;
}

pub struct InMemoryQueueBackend {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    expiration: Option<Duration>,
}

impl InMemoryQueueBackend {
    /// `None` keeps messages until they are read.
    pub fn new(expiration: Option<Duration>) -> Self {
        info!(
            expiration_secs = expiration.map(|value| value.as_secs()),
            "in-memory queue backend ready"
        );
        Self {
            queues: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            expiration,
        }
    }

    fn has_messages(&self, client_id: &str) -> bool {
        self.queues
            .lock()
            .get(client_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    fn waiter(&self, client_id: &str) -> Arc<Notify> {
        Arc::clone(self.waiters.lock().entry(client_id.to_string()).or_default())
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MESSAGE_EXPIRATION))
    }
}

/// Drops the client's waiter entry when the last parked reader leaves,
/// including when the waiting future is cancelled.
struct WaiterGuard<'a> {
    backend: &'a InMemoryQueueBackend,
    client_id: &'a str,
    notify: Arc<Notify>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut waiters = self.backend.waiters.lock();
        let last = waiters
            .get(self.client_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.notify) && Arc::strong_count(entry) == 2);
        if last {
            waiters.remove(self.client_id);
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn send_message(&self, recipient_id: &str, message: Message) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(recipient_id.to_string()).or_default();
        queue.push_back(message);
        debug!(recipient_id, queued = queue.len(), "message queued");
    }

    async fn get_messages(&self, client_id: &str, pop: bool) -> Vec<Message> {
        let mut queues = self.queues.lock();
        if pop {
            queues
                .remove(client_id)
                .map(Vec::from)
                .unwrap_or_default()
        } else {
            queues
                .get(client_id)
                .map(|queue| queue.iter().cloned().collect())
                .unwrap_or_default()
        }
    }

    async fn cleanup_expired_messages(&self) -> usize {
        let Some(expiration) = self.expiration else {
            return 0;
        };
        let Ok(max_age) = chrono::Duration::from_std(expiration) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut removed = 0;
        self.queues.lock().retain(|recipient_id, queue| {
            let before = queue.len();
            queue.retain(|message| message.sent_at > cutoff);
            let expired = before - queue.len();
            if expired > 0 {
                info!(recipient_id = %recipient_id, expired, "expired messages dropped");
            }
            removed += expired;
            !queue.is_empty()
        });
        removed
    }

    async fn wait_for_new_message(&self, client_id: &str, timeout: Duration) -> bool {
        let guard = WaiterGuard {
            backend: self,
            client_id,
            notify: self.waiter(client_id),
        };

        let notified = guard.notify.notified();
        tokio::pin!(notified);
        // Registered before the queue check so a send in between still wakes us.
        notified.as_mut().enable();

        if self.has_messages(client_id) {
            return true;
        }

        debug!(client_id, timeout_secs = timeout.as_secs_f64(), "waiting for messages");
        let woken = tokio::time::timeout(timeout, notified).await.is_ok();
        woken && self.has_messages(client_id)
    }

    async fn notify_new_message(&self, client_id: &str) {
        if let Some(notify) = self.waiters.lock().get(client_id) {
            notify.notify_waiters();
        }
    }

    async fn stats(&self) -> QueueStats {
        let queues = self.queues.lock();
        QueueStats {
            total_queues: queues.len(),
            total_messages: queues.values().map(VecDeque::len).sum(),
            active_waiters: self.waiters.lock().len(),
        }
    }

    async fn queue_lengths(&self) -> HashMap<String, usize> {
        self.queues
            .lock()
            .iter()
            .map(|(client_id, queue)| (client_id.clone(), queue.len()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("❌ **Error**: Sender ID cannot be empty")]
    EmptySender,
    #[error("❌ **Error**: Recipient ID cannot be empty")]
    EmptyRecipient,
    #[error("⚠️ **Warning**: Sending empty message")]
    EmptyContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait for messages cancelled")]
pub struct WaitCancelled;

#[derive(Debug, Clone, Copy)]
pub struct MessagingTimeouts {
    pub get_messages: Duration,
    pub send_and_wait: Duration,
}

impl Default for MessagingTimeouts {
    fn default() -> Self {
        Self {
            get_messages: DEFAULT_GET_MESSAGES_WAIT,
            send_and_wait: DEFAULT_SEND_AND_WAIT_TIMEOUT,
        }
    }
}

/// Markdown-producing messaging operations on top of a [`QueueBackend`].
pub struct MessagingService {
    backend: Arc<dyn QueueBackend>,
    clients: ClientDirectory,
    timeouts: MessagingTimeouts,
}

impl MessagingService {
    pub fn new(backend: Arc<dyn QueueBackend>, timeouts: MessagingTimeouts) -> Self {
        Self {
            backend,
            clients: ClientDirectory::new(),
            timeouts,
        }
    }

    pub fn in_memory(expiration: Option<Duration>, timeouts: MessagingTimeouts) -> Self {
        Self::new(Arc::new(InMemoryQueueBackend::new(expiration)), timeouts)
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn clients(&self) -> &ClientDirectory {
        &self.clients
    }

    pub async fn record_activity(&self, profile: ClientProfile) {
        self.clients.record(profile, self.backend.as_ref()).await;
    }

    pub async fn activity_report(&self) -> ActivityReport {
        self.clients.report(self.backend.as_ref()).await
    }

    pub async fn checkin_client(&self, client_id: &str, name: &str, capabilities: &str) -> String {
        if client_id.trim().is_empty() {
            return "❌ **Error**: Client ID cannot be empty".to_string();
        }

        self.record_activity(ClientProfile {
            client_id: client_id.to_string(),
            name: name.to_string(),
            description: capabilities.to_string(),
            client_type: CHECKED_IN_CLIENT_TYPE.to_string(),
        })
        .await;
        info!(client_id, name, capabilities, "client checked in");

        format!(
            "👋 **Checked in successfully** as `{client_id}`  \n**Name:** {name}  \n**Capabilities:** {capabilities}"
        )
    }

    pub async fn send_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<(), SendRejection> {
        self.backend.cleanup_expired_messages().await;

        if sender_id.trim().is_empty() {
            return Err(SendRejection::EmptySender);
        }
        if recipient_id.trim().is_empty() {
            return Err(SendRejection::EmptyRecipient);
        }
        if content.trim().is_empty() {
            return Err(SendRejection::EmptyContent);
        }

        self.backend
            .send_message(recipient_id, Message::new(sender_id, content))
            .await;
        self.backend.notify_new_message(recipient_id).await;
        info!(sender_id, recipient_id, length = content.len(), "message sent");
        Ok(())
    }

    /// Sends one message per `(recipient, content)` pair, then appends
    /// whatever is already waiting for the sender.
    pub async fn send_without_waiting(&self, sender_id: &str, deliveries: &[(String, String)]) -> String {
        if deliveries.is_empty() {
            return "❌ **Error**: At least one recipient must be specified".to_string();
        }

        let mut sent = Vec::new();
        let mut failed = Vec::new();
        for (recipient_id, content) in deliveries {
            match self.send_message(sender_id, recipient_id, content).await {
                Ok(()) => sent.push(format!("  - **{recipient_id}**: ✅ Message sent")),
                Err(rejection) => failed.push(format!("  - **{recipient_id}**: {rejection}")),
            }
        }

        let mut parts = vec![
            format!(
                "📡 **Message Delivery Complete** ({}/{} successful)",
                sent.len(),
                deliveries.len()
            ),
            String::new(),
        ];
        if !sent.is_empty() {
            parts.push("**✅ Successful sends:**".to_string());
            parts.append(&mut sent);
            parts.push(String::new());
        }
        if !failed.is_empty() {
            parts.push("**❌ Failed sends:**".to_string());
            parts.append(&mut failed);
            parts.push(String::new());
        }

        self.backend.cleanup_expired_messages().await;
        let pending = self.backend.get_messages(sender_id, true).await;
        if pending.is_empty() {
            parts.push("💡 **Tip**: Use `get_messages` to check for responses later.".to_string());
        } else {
            parts.push("---".to_string());
            parts.push(String::new());
            parts.push(format_messages(sender_id, &pending, Utc::now()));
        }

        parts.join("\n")
    }

    /// Pops the sender's queue, parking up to the configured wait when it is
    /// empty.
    pub async fn get_messages(
        &self,
        sender_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<String, WaitCancelled> {
        self.backend.cleanup_expired_messages().await;

        if sender_id.trim().is_empty() {
            return Ok(SendRejection::EmptySender.to_string());
        }

        let messages = self.backend.get_messages(sender_id, true).await;
        if !messages.is_empty() {
            info!(sender_id, count = messages.len(), "messages retrieved");
            return Ok(format_messages(sender_id, &messages, Utc::now()));
        }

        if !self.wait(sender_id, self.timeouts.get_messages, cancellation).await? {
            debug!(sender_id, "no messages before wait expired");
            return Ok(format!(
                "{NO_MESSAGES}\n\n💡 **Tip:** Be sure you are using your sender_id (`my_sender_id`) from your `mcp_recipients.json` file, and try again."
            ));
        }

        let messages = self.backend.get_messages(sender_id, true).await;
        if messages.is_empty() {
            return Ok(NO_MESSAGES.to_string());
        }
        info!(sender_id, count = messages.len(), "messages retrieved after waiting");
        Ok(format_messages(sender_id, &messages, Utc::now()))
    }

    /// Sends, then blocks until something arrives in the sender's own queue.
    pub async fn send_and_wait(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        cancellation: &CancellationToken,
    ) -> Result<String, WaitCancelled> {
        if let Err(rejection) = self.send_message(sender_id, recipient_id, content).await {
            return Ok(rejection.to_string());
        }

        let timeout = self.timeouts.send_and_wait;
        info!(sender_id, timeout_secs = timeout.as_secs(), "waiting for reply");
        if !self.wait(sender_id, timeout, cancellation).await? {
            return Ok(format!(
                "⏰ **Timeout**: No response received within {} seconds",
                timeout.as_secs()
            ));
        }

        let messages = self.backend.get_messages(sender_id, true).await;
        if messages.is_empty() {
            return Ok("📭 **No response received** (queue was empty)".to_string());
        }
        Ok(format_messages(sender_id, &messages, Utc::now()))
    }

    async fn wait(
        &self,
        client_id: &str,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<bool, WaitCancelled> {
        tokio::select! {
            _ = cancellation.cancelled() => Err(WaitCancelled),
            arrived = self.backend.wait_for_new_message(client_id, timeout) => Ok(arrived),
        }
    }
}

const NO_MESSAGES: &str = "📭 **No messages** for you right now.";

pub fn format_messages(recipient_id: &str, messages: &[Message], now: DateTime<Utc>) -> String {
    if messages.is_empty() {
        return NO_MESSAGES.to_string();
    }

    let plural = if messages.len() > 1 { "s" } else { "" };
    let mut parts = vec![format!(
        "📬 **{} message{plural} for `{recipient_id}`:**\n",
        messages.len()
    )];
    parts.extend(messages.iter().map(|message| {
        format!(
            "**From:** `{}` ({})\n{}\n",
            message.from_client_id,
            format_relative_time(message.sent_at, now),
            message.content
        )
    }));
    parts.join("\n")
}
