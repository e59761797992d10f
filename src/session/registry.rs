//! Session registry
//!
//! Thread-safe session management using DashMap for concurrent access.
//! Per-session mutations go through entry locks plus an attempt-generation
//! check, so transitions for one session are serialized while sessions
//! stay fully parallel with each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use super::health::HealthTracker;
use super::heartbeat::HeartbeatGuard;
use super::state::{ConnectionState, StateError};
use super::types::{SessionEntry, SessionInfo, SessionStats};
use crate::backend::BackendHandle;
use crate::config::HostConfig;
use crate::error::LastError;

/// Default maximum concurrent sessions
const DEFAULT_MAX_SESSIONS: usize = 20;

#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection limit reached ({current}/{max})")]
    LimitReached { current: usize, max: usize },

    #[error(transparent)]
    State(#[from] StateError),

    /// The result belongs to a superseded attempt and must be discarded
    #[error("stale attempt generation for session {0}")]
    Stale(String),
}

/// What `cancel` tore down; the caller releases the backend side
pub struct CancelOutcome {
    pub handle: Option<BackendHandle>,
}

/// Registry of all sessions managed by the engine
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    max_sessions: AtomicUsize,
    /// Prevents a TOCTOU race between the limit check and the insert
    create_lock: parking_lot::Mutex<()>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions: AtomicUsize::new(max_sessions),
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::SeqCst);
    }

    /// Create a new session in Disconnected state
    pub fn create_session(&self, config: HostConfig) -> Result<String, RegistryError> {
        let _guard = self.create_lock.lock();

        let current = self.sessions.len();
        let max = self.max_sessions();
        if current >= max {
            return Err(RegistryError::LimitReached { current, max });
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating session {}: {}@{}:{}",
            session_id, config.username, config.host, config.port
        );

        self.sessions
            .insert(session_id.clone(), SessionEntry::new(session_id.clone(), config));
        Ok(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Immutable config snapshot for a fresh connection attempt
    pub fn config(&self, session_id: &str) -> Result<HostConfig, RegistryError> {
        self.with_entry(session_id, |entry| entry.config.clone())
    }

    pub fn state(&self, session_id: &str) -> Result<ConnectionState, RegistryError> {
        self.with_entry(session_id, |entry| entry.state())
    }

    pub fn last_error(&self, session_id: &str) -> Result<Option<LastError>, RegistryError> {
        self.with_entry(session_id, |entry| entry.last_error())
    }

    pub fn generation(&self, session_id: &str) -> Result<u64, RegistryError> {
        self.with_entry(session_id, |entry| entry.generation())
    }

    pub fn health(&self, session_id: &str) -> Result<Option<Arc<HealthTracker>>, RegistryError> {
        self.with_entry(session_id, |entry| entry.health.clone())
    }

    /// UI snapshot; the reconnect observables are supplied by the engine
    pub fn info(
        &self,
        session_id: &str,
        is_reconnecting: bool,
        reconnect_attempts: u32,
    ) -> Result<SessionInfo, RegistryError> {
        self.with_entry(session_id, |entry| SessionInfo {
            id: entry.id.clone(),
            name: entry.config.display_name(),
            host: entry.config.host.clone(),
            port: entry.config.port,
            kind: entry.config.kind,
            state: entry.state(),
            last_error: entry.last_error(),
            is_reconnecting,
            reconnect_attempts,
            uptime_secs: entry.uptime_secs(),
        })
    }

    pub fn stats(&self) -> SessionStats {
        let mut connecting = 0;
        let mut live = 0;
        let mut failed = 0;
        for entry in self.sessions.iter() {
            let state = entry.state();
            if state.is_connecting() {
                connecting += 1;
            } else if state.is_live() {
                live += 1;
            } else if state.is_retryable() {
                failed += 1;
            }
        }
        SessionStats {
            total: self.sessions.len(),
            connecting,
            live,
            failed,
            max_sessions: self.max_sessions(),
        }
    }

    /// Begin a fresh connection attempt: transition to Connecting, bump
    /// the generation, and return the generation identifying this attempt.
    ///
    /// Supersedes any previous live handle: the caller receives it for
    /// disconnection and the heartbeat monitor is stopped.
    pub fn begin_attempt(
        &self,
        session_id: &str,
    ) -> Result<(u64, Option<BackendHandle>), RegistryError> {
        let mut entry = self.entry_mut(session_id)?;

        entry.state_machine.start_connecting()?;
        let generation = entry.bump_generation();

        if let Some(heartbeat) = entry.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(health) = entry.health.take() {
            health.deactivate();
        }
        let superseded = entry.handle.take();

        debug!(
            "Session {} state -> Connecting (generation {})",
            session_id, generation
        );
        Ok((generation, superseded))
    }

    /// The backend requested authentication for the current attempt
    pub fn mark_authenticating(
        &self,
        session_id: &str,
        generation: u64,
    ) -> Result<(), RegistryError> {
        let entry = self.entry_mut(session_id)?;
        if !entry.is_current(generation) {
            return Err(RegistryError::Stale(session_id.to_string()));
        }
        entry.state_machine.auth_started()?;
        debug!("Session {} state -> Authenticating", session_id);
        Ok(())
    }

    /// Apply a successful connect result for `generation`.
    ///
    /// A stale result (session closed, cancelled, or re-connected since)
    /// is rejected with `RegistryError::Stale`; the caller must release
    /// the handle itself.
    pub fn complete_attempt(
        &self,
        session_id: &str,
        generation: u64,
        handle: BackendHandle,
        health: Arc<HealthTracker>,
    ) -> Result<(), RegistryError> {
        let mut entry = self.entry_mut(session_id)?;
        if !entry.is_current(generation) {
            return Err(RegistryError::Stale(session_id.to_string()));
        }

        entry.state_machine.connect_success()?;
        entry.state_machine.mark_ready()?;
        entry.handle = Some(handle);
        entry.health = Some(health);

        info!("Session {} connected (generation {})", session_id, generation);
        Ok(())
    }

    /// Attach the heartbeat monitor guard for the current live episode
    pub fn set_heartbeat(
        &self,
        session_id: &str,
        generation: u64,
        guard: HeartbeatGuard,
    ) -> Result<(), RegistryError> {
        let mut entry = self.entry_mut(session_id)?;
        if !entry.is_current(generation) {
            guard.stop();
            return Err(RegistryError::Stale(session_id.to_string()));
        }
        entry.heartbeat = Some(guard);
        Ok(())
    }

    /// Apply an attempt failure for `generation`
    pub fn fail_attempt(
        &self,
        session_id: &str,
        generation: u64,
        error: LastError,
    ) -> Result<(), RegistryError> {
        let mut entry = self.entry_mut(session_id)?;
        if !entry.is_current(generation) {
            return Err(RegistryError::Stale(session_id.to_string()));
        }

        entry.state_machine.fail(error)?;
        if let Some(heartbeat) = entry.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(health) = entry.health.take() {
            health.deactivate();
        }
        entry.handle = None;

        debug!("Session {} state -> Failed", session_id);
        Ok(())
    }

    /// Apply a connect deadline expiry for `generation`
    pub fn timeout_attempt(
        &self,
        session_id: &str,
        generation: u64,
        error: LastError,
    ) -> Result<(), RegistryError> {
        let mut entry = self.entry_mut(session_id)?;
        if !entry.is_current(generation) {
            return Err(RegistryError::Stale(session_id.to_string()));
        }
        entry.state_machine.timeout(error)?;
        debug!("Session {} state -> Timeout", session_id);
        Ok(())
    }

    /// User cancellation: invalidate outstanding work, return the live
    /// handle (if any) so the caller can disconnect it
    pub fn cancel(&self, session_id: &str) -> Result<CancelOutcome, RegistryError> {
        let mut entry = self.entry_mut(session_id)?;

        let generation = entry.bump_generation();
        entry.state_machine.cancel();
        if let Some(heartbeat) = entry.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(health) = entry.health.take() {
            health.deactivate();
        }
        let handle = entry.handle.take();

        info!(
            "Session {} cancelled (now generation {})",
            session_id, generation
        );
        Ok(CancelOutcome { handle })
    }

    /// Remove a session entirely; the caller disconnects the returned
    /// handle. Outstanding results for the removed session fail their
    /// lookup and are discarded.
    pub fn remove(&self, session_id: &str) -> Option<SessionEntry> {
        let (_, mut entry) = self.sessions.remove(session_id)?;
        entry.bump_generation();
        if let Some(heartbeat) = entry.heartbeat.take() {
            heartbeat.stop();
        }
        if let Some(health) = entry.health.take() {
            health.deactivate();
        }
        info!("Session {} removed", session_id);
        Some(entry)
    }

    fn entry_mut(
        &self,
        session_id: &str,
    ) -> Result<dashmap::mapref::one::RefMut<'_, String, SessionEntry>, RegistryError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&SessionEntry) -> T,
    ) -> Result<T, RegistryError> {
        self.sessions
            .get(session_id)
            .map(|entry| f(entry.value()))
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))
    }
}
