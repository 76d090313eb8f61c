//! Messaging client directory
//!
//! Remembers who called the messaging tools and when, for the
//! `/api/sessions` overview. Clients are keyed by their self-declared sender
//! id, independent of transport sessions.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::domain::messaging::{QueueBackend, QueueStats};

pub const DEFAULT_CLIENT_TYPE: &str = "agent by IDE";
pub const CHECKED_IN_CLIENT_TYPE: &str = "checked-in client";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub client_id: String,
    pub name: String,
    pub description: String,
    pub client_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientActivity {
    pub client_id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "clientType")]
    pub client_type: String,
    pub last_seen: String,
    pub messages_in_queue: usize,
}

impl ClientActivity {
    fn untracked(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            name: client_id.to_string(),
            description: "Client with messages in queue".to_string(),
            client_type: "untracked client".to_string(),
            last_seen: now_rfc3339(),
            messages_in_queue: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityReport {
    #[serde(rename = "messagingClients")]
    pub messaging_clients: Vec<ClientActivity>,
    #[serde(rename = "queueStats")]
    pub queue_stats: QueueStats,
    pub total_messages: usize,
}

#[derive(Debug, Default)]
pub struct ClientDirectory {
    clients: Mutex<HashMap<String, ClientActivity>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, profile: ClientProfile, backend: &dyn QueueBackend) {
        let queued = backend
            .queue_lengths()
            .await
            .get(&profile.client_id)
            .copied()
            .unwrap_or(0);

        let activity = ClientActivity {
            client_id: profile.client_id.clone(),
            name: profile.name,
            description: profile.description,
            client_type: profile.client_type,
            last_seen: now_rfc3339(),
            messages_in_queue: queued,
        };
        self.clients.lock().insert(profile.client_id, activity);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every client with a queue, tracked or not, then every tracked client
    /// without one. Queue counts are taken fresh from the backend.
    pub async fn report(&self, backend: &dyn QueueBackend) -> ActivityReport {
        let queue_stats = backend.stats().await;
        let mut lengths: Vec<(String, usize)> = backend.queue_lengths().await.into_iter().collect();
        lengths.sort();

        let clients = self.clients.lock();
        let mut messaging_clients: Vec<ClientActivity> = lengths
            .iter()
            .map(|(client_id, queued)| {
                let mut activity = clients
                    .get(client_id)
                    .cloned()
                    .unwrap_or_else(|| ClientActivity::untracked(client_id));
                activity.messages_in_queue = *queued;
                activity
            })
            .collect();

        let mut idle: Vec<ClientActivity> = clients
            .values()
            .filter(|activity| !lengths.iter().any(|(id, _)| *id == activity.client_id))
            .cloned()
            .map(|activity| ClientActivity {
                messages_in_queue: 0,
                ..activity
            })
            .collect();
        idle.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        messaging_clients.append(&mut idle);

        ActivityReport {
            messaging_clients,
            total_messages: queue_stats.total_messages,
            queue_stats,
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
