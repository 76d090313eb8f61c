//! Session registry
//!
//! Owns every session record. Create, attach and destroy take the write lock;
//! lookups share the read lock. Handlers receive the registry by injection
//! through `AppState`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::TransportError;
use crate::mcp::codec::{OutboundMessage, RequestId};
use crate::transport::stream::StreamHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait SessionIdGenerator: Send + Sync {
    fn next_id(&self) -> Result<SessionId, TransportError>;
}

#[derive(Debug, Default)]
pub struct UuidGenerator;

impl SessionIdGenerator for UuidGenerator {
    fn next_id(&self) -> Result<SessionId, TransportError> {
        Ok(SessionId(Uuid::new_v4().to_string()))
    }
}

/// Deterministic ids (`seq-1`, `seq-2`, ...). Refuses to wrap around.
#[derive(Debug)]
pub struct SequentialGenerator {
    next: AtomicU64,
}

impl SequentialGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdGenerator for SequentialGenerator {
    fn next_id(&self) -> Result<SessionId, TransportError> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_add(1)
            })
            .map(|value| SessionId(format!("seq-{value}")))
            .map_err(|_| TransportError::IdentifiersExhausted)
    }
}

pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    stream: Mutex<Option<Arc<StreamHandle>>>,
    pending: AtomicUsize,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    closed: CancellationToken,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            stream: Mutex::new(None),
            pending: AtomicUsize::new(0),
            in_flight: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The stream attached right now, if it still accepts pushes.
    pub fn stream(&self) -> Option<Arc<StreamHandle>> {
        self.stream.lock().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been destroyed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Token cancelled when the session is destroyed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.closed.child_token()
    }

    /// Counts a request against this session until the guard is dropped and
    /// registers its cancellation token under the request id.
    pub fn begin_request(self: &Arc<Self>, request_id: &RequestId) -> PendingRequest {
        let token = self.closed.child_token();
        self.in_flight
            .lock()
            .insert(request_id.clone(), token.clone());
        self.pending.fetch_add(1, Ordering::SeqCst);

        PendingRequest {
            session: Arc::clone(self),
            request_id: request_id.clone(),
            token,
        }
    }

    /// Cancels an in-flight request. Returns false if it is unknown or done.
    pub fn cancel_request(&self, request_id: &RequestId) -> bool {
        match self.in_flight.lock().get(request_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub struct PendingRequest {
    session: Arc<Session>,
    request_id: RequestId,
    token: CancellationToken,
}

impl PendingRequest {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.session.in_flight.lock().remove(&self.request_id);
        self.session.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<Session>>>>,
    generator: Arc<dyn SessionIdGenerator>,
    accepting: Arc<AtomicBool>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_generator(Arc::new(UuidGenerator))
    }

    pub fn with_generator(generator: Arc<dyn SessionIdGenerator>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            generator,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Refused with `ShuttingDown` once [`stop_accepting`](Self::stop_accepting)
    /// has run.
    pub fn create_session(&self) -> Result<Arc<Session>, TransportError> {
        let mut sessions = self.sessions.write();
        if !self.is_accepting() {
            return Err(TransportError::ShuttingDown);
        }

        let id = self.generator.next_id()?;
        let session = Arc::new(Session::new(id.clone()));
        sessions.insert(id.clone(), Arc::clone(&session));
        drop(sessions);

        info!(session_id = %id, "session created");
        Ok(session)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Closes the registry to new sessions and new streams. Taken under the
    /// write lock, so no create or attach that started earlier can land after
    /// this returns.
    pub fn stop_accepting(&self) {
        let _sessions = self.sessions.write();
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn lookup(&self, id: &SessionId) -> Result<Arc<Session>, TransportError> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(TransportError::SessionNotFound)
    }

    /// Makes `stream` the session's only push target. A previously attached
    /// stream is closed before this returns.
    pub fn attach_stream(
        &self,
        id: &SessionId,
        stream: Arc<StreamHandle>,
    ) -> Result<(), TransportError> {
        let previous = {
            let sessions = self.sessions.write();
            if !self.is_accepting() {
                return Err(TransportError::ShuttingDown);
            }
            let session = sessions.get(id).ok_or(TransportError::SessionNotFound)?;
            let mut slot = session.stream.lock();
            slot.replace(Arc::clone(&stream))
        };

        if let Some(previous) = previous {
            previous.close();
            info!(
                session_id = %id,
                replaced_stream_id = previous.id(),
                stream_id = stream.id(),
                "stream replaced"
            );
        } else {
            info!(session_id = %id, stream_id = stream.id(), "stream attached");
        }
        Ok(())
    }

    /// Clears the session's stream reference if it still points at
    /// `stream_id`. The session itself stays alive.
    pub fn detach_stream(&self, id: &SessionId, stream_id: u64) {
        let sessions = self.sessions.read();
        let Some(session) = sessions.get(id) else {
            return;
        };

        let mut slot = session.stream.lock();
        if slot.as_ref().is_some_and(|stream| stream.id() == stream_id) {
            *slot = None;
            debug!(session_id = %id, stream_id, "stream detached");
        }
    }

    /// Idempotent. Returns whether a session was actually removed.
    pub fn destroy(&self, id: &SessionId) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };

        if let Some(stream) = session.stream.lock().take() {
            stream.close();
        }
        session.closed.cancel();
        info!(
            session_id = %id,
            pending_requests = session.pending_requests(),
            age_ms = (Utc::now() - session.created_at()).num_milliseconds(),
            "session destroyed"
        );
        true
    }

    /// Delivers a message to whatever stream the session has attached now.
    pub async fn publish(
        &self,
        id: &SessionId,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        let session = self.lookup(id).map_err(|_| TransportError::SessionClosed)?;
        let stream = session.stream().ok_or(TransportError::StreamNotAttached)?;
        stream.push(message).await
    }

    /// Moves every attached stream to `Draining` and returns them so the
    /// caller can wait for their queues to flush.
    pub fn drain_streams(&self) -> Vec<Arc<StreamHandle>> {
        let streams: Vec<Arc<StreamHandle>> = self
            .sessions
            .read()
            .values()
            .filter_map(|session| session.stream())
            .collect();

        for stream in &streams {
            stream.drain();
        }
        streams
    }

    pub fn destroy_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        ids.iter().filter(|id| self.destroy(id)).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
