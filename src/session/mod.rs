//! Streaming sessions
//!
//! A session ties one viewer connection to a session id. The host side
//! (`host`) feeds capture output into the connection and turns viewer
//! requests into capture-loop commands.
//!
//! Every host session runs its own capture pipeline: a capture thread,
//! an orchestrator, and a GPU duplication of the display it streams.
//! `ViewerSlots` bounds how many of those exist at once.

pub mod host;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::transport::{FrameTransport, TransportState};

pub use host::{HostSession, HostSessionStats};

/// One viewer connection and the session it belongs to
#[derive(Debug, Clone)]
pub struct StreamingSession {
    session_id: Uuid,
    transport: FrameTransport,
    created_at: Instant,
}

impl StreamingSession {
    /// Creates a session over an open transport
    pub fn new(session_id: Uuid, transport: FrameTransport) -> Self {
        Self {
            session_id,
            transport,
            created_at: Instant::now(),
        }
    }

    /// Session id stamped on outbound payloads
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Id of the viewer's connection
    pub fn viewer_connection_id(&self) -> Uuid {
        self.transport.id()
    }

    /// The viewer connection
    pub fn transport(&self) -> &FrameTransport {
        &self.transport
    }

    /// Time since the session was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns true while the connection is open
    pub fn is_active(&self) -> bool {
        self.transport.state() == TransportState::Open
    }

    /// Closes the viewer connection
    pub async fn close(&self, reason: &str) {
        self.transport.close(reason).await;
    }

    /// Resolves once the viewer connection has closed
    pub async fn wait_for_close(&self) {
        self.transport.wait_for_close().await;
    }
}

/// Admission control for concurrent host sessions
#[derive(Debug, Clone)]
pub struct ViewerSlots {
    slots: Arc<Semaphore>,
}

impl ViewerSlots {
    /// Allows up to `capacity` sessions at once
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Takes a slot if one is free; the slot returns when the permit drops
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
