//! Lifecycle controller
//!
//! Shutdown order: refuse new work, drain every stream, wait (bounded) for
//! in-flight dispatches and for the drained queues to reach their clients,
//! destroy the remaining sessions, then report `Terminated`.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::errors::TransportError;
use crate::transport::session::SessionRegistry;
use crate::transport::stream::StreamState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub streams_drained: usize,
    pub sessions_destroyed: usize,
    pub grace_expired: bool,
}

struct Inner {
    registry: SessionRegistry,
    grace: Duration,
    state: watch::Sender<LifecycleState>,
    in_flight: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(registry: SessionRegistry, grace: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                registry,
                grace,
                state,
                in_flight,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Registers one unit of in-flight work. Refused once shutdown started.
    pub fn begin(&self) -> Result<InFlightGuard, TransportError> {
        self.inner.in_flight.send_modify(|count| *count += 1);
        let guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
        };

        if !self.is_accepting() {
            return Err(TransportError::ShuttingDown);
        }
        Ok(guard)
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let mut started = false;
        self.inner.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                started = true;
            }
            started
        });

        if !started {
            self.terminated().await;
            return ShutdownReport {
                streams_drained: 0,
                sessions_destroyed: 0,
                grace_expired: false,
            };
        }

        info!(
            sessions = self.inner.registry.len(),
            in_flight = self.in_flight(),
            "shutdown started"
        );
        self.inner.registry.stop_accepting();
        let drained = self.inner.registry.drain_streams();
        let streams_drained = drained.len();

        let mut in_flight = self.inner.in_flight.subscribe();
        let settled = async {
            let _ = in_flight.wait_for(|count| *count == 0).await;
            join_all(drained.iter().map(|stream| stream.closed())).await;
        };
        let grace_expired = tokio::time::timeout(self.inner.grace, settled)
            .await
            .is_err();
        if grace_expired {
            let unflushed = drained
                .iter()
                .filter(|stream| stream.state() != StreamState::Closed)
                .count();
            warn!(
                in_flight = self.in_flight(),
                unflushed_streams = unflushed,
                grace_secs = self.inner.grace.as_secs_f64(),
                "grace period expired before work settled"
            );
        }

        let sessions_destroyed = self.inner.registry.destroy_all();
        self.inner.state.send_replace(LifecycleState::Terminated);
        info!(streams_drained, sessions_destroyed, "shutdown complete");

        ShutdownReport {
            streams_drained,
            sessions_destroyed,
            grace_expired,
        }
    }

    pub async fn terminated(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == LifecycleState::Terminated)
            .await;
    }
}

pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
