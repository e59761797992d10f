//! Backend collaborator boundary
//!
//! The engine does not implement the wire protocol. A backend exposes
//! connect/disconnect/probe primitives plus a per-session event stream;
//! the engine drives lifecycle on top of those.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::chain::ResolvedChain;
use crate::config::ConnectionKind;

/// Opaque handle to a live backend session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub u64);

/// Result of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Lifecycle events emitted by the backend, scoped per session
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Session output bytes
    Output { session_id: String, data: Vec<u8> },
    /// The connect in flight entered its authentication phase
    AuthStarted { session_id: String },
    /// Remote side exited
    Exit {
        session_id: String,
        code: Option<i32>,
        reason: String,
    },
    /// Backend-level error for a session
    Error { session_id: String, message: String },
}

impl BackendEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Output { session_id, .. }
            | Self::AuthStarted { session_id }
            | Self::Exit { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }
}

/// Backend-specific failures; handlers normalize these into the shared
/// engine taxonomy
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Asynchronous command boundary to the transport implementation
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Establish a session of the given kind through the resolved chain.
    ///
    /// Credential material referenced by the chain is guaranteed to exist
    /// for the duration of this call and may be deleted as soon as it
    /// returns.
    async fn connect(
        &self,
        kind: ConnectionKind,
        chain: &ResolvedChain,
        session_id: &str,
    ) -> Result<BackendHandle, BackendError>;

    /// Tear down a live session; idempotent for unknown handles
    async fn disconnect(&self, handle: BackendHandle);

    /// Probe a live session for liveness
    async fn probe(&self, handle: BackendHandle) -> Liveness;

    /// Subscribe to the backend's lifecycle event stream
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}
