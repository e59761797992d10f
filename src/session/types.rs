//! Session types and data structures

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use super::health::HealthTracker;
use super::heartbeat::HeartbeatGuard;
use super::state::{ConnectionState, SessionStateMachine};
use crate::backend::BackendHandle;
use crate::config::{ConnectionKind, HostConfig};
use crate::error::LastError;

/// An active session entry in the registry
///
/// Only the engine mutates this; the UI layer reads snapshots through the
/// registry's observable getters.
pub struct SessionEntry {
    /// Unique session ID
    pub id: String,
    /// Owning host configuration, immutable for the session's lifetime
    pub config: HostConfig,
    /// State machine for lifecycle management
    pub state_machine: SessionStateMachine,
    /// Attempt generation counter. Bumped when a new attempt starts and
    /// when the session is cancelled or closed; results carrying an older
    /// generation are discarded instead of applied.
    generation: AtomicU64,
    /// Live backend handle, present only in Connected/Ready
    pub handle: Option<BackendHandle>,
    /// Health tracker for the current live episode
    pub health: Option<Arc<HealthTracker>>,
    /// Heartbeat monitor guard for the current live episode
    pub heartbeat: Option<HeartbeatGuard>,
    /// Creation timestamp
    pub created_at: Instant,
}

impl SessionEntry {
    pub fn new(id: String, config: HostConfig) -> Self {
        Self {
            id,
            config,
            state_machine: SessionStateMachine::new(),
            generation: AtomicU64::new(0),
            handle: None,
            health: None,
            heartbeat: None,
            created_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_machine.state()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.state_machine.last_error()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate all outstanding work for this session and return the new
    /// generation
    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether `generation` still identifies the current attempt
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }
}

/// Session info snapshot for the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub kind: ConnectionKind,
    pub state: ConnectionState,
    pub last_error: Option<LastError>,
    pub is_reconnecting: bool,
    pub reconnect_attempts: u32,
    pub uptime_secs: u64,
}

/// Aggregate session statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub connecting: usize,
    pub live: usize,
    pub failed: usize,
    pub max_sessions: usize,
}
