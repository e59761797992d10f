//! Connection handler taxonomy
//!
//! Handlers are a tagged variant over the connection capabilities. Each
//! variant turns a resolved chain plus session id into a backend connect
//! request for its kind and translates backend failures into the shared
//! error taxonomy. The variant is selected once, at factory time.

mod factory;

pub use factory::HandlerFactory;

use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, BackendError, BackendHandle, Liveness};
use crate::chain::ResolvedChain;
use crate::config::ConnectionKind;
use crate::error::EngineError;

/// Handler for one session, bound to a connection kind
#[derive(Clone)]
pub enum ConnectionHandler {
    Shell(ShellHandler),
    FileTransfer(FileTransferHandler),
    RawStream(RawStreamHandler),
}

impl ConnectionHandler {
    pub fn kind(&self) -> ConnectionKind {
        match self {
            Self::Shell(_) => ConnectionKind::Shell,
            Self::FileTransfer(_) => ConnectionKind::FileTransfer,
            Self::RawStream(_) => ConnectionKind::RawStream,
        }
    }

    /// Request a connection of this handler's kind through the chain
    pub async fn connect(
        &self,
        session_id: &str,
        chain: &ResolvedChain,
    ) -> Result<BackendHandle, EngineError> {
        match self {
            Self::Shell(h) => h.connect(session_id, chain).await,
            Self::FileTransfer(h) => h.connect(session_id, chain).await,
            Self::RawStream(h) => h.connect(session_id, chain).await,
        }
    }

    /// Release the backend session behind `handle`
    pub async fn disconnect(&self, handle: BackendHandle) {
        match self {
            Self::Shell(h) => h.backend.disconnect(handle).await,
            Self::FileTransfer(h) => h.backend.disconnect(handle).await,
            Self::RawStream(h) => h.backend.disconnect(handle).await,
        }
    }

    /// Probe the backend session for liveness
    pub async fn probe(&self, handle: BackendHandle) -> Liveness {
        match self {
            Self::Shell(h) => h.backend.probe(handle).await,
            Self::FileTransfer(h) => h.backend.probe(handle).await,
            Self::RawStream(h) => h.backend.probe(handle).await,
        }
    }
}

/// Interactive shell sessions
#[derive(Clone)]
pub struct ShellHandler {
    backend: Arc<dyn Backend>,
}

impl ShellHandler {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn connect(
        &self,
        session_id: &str,
        chain: &ResolvedChain,
    ) -> Result<BackendHandle, EngineError> {
        debug!(
            "Shell connect for session {} through {} hops",
            session_id,
            chain.len()
        );
        self.backend
            .connect(ConnectionKind::Shell, chain, session_id)
            .await
            .map_err(normalize)
    }
}

/// File transfer sessions (listing, upload, download)
#[derive(Clone)]
pub struct FileTransferHandler {
    backend: Arc<dyn Backend>,
}

impl FileTransferHandler {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn connect(
        &self,
        session_id: &str,
        chain: &ResolvedChain,
    ) -> Result<BackendHandle, EngineError> {
        debug!(
            "File transfer connect for session {} to {}",
            session_id,
            chain.leaf().host
        );
        self.backend
            .connect(ConnectionKind::FileTransfer, chain, session_id)
            .await
            .map_err(normalize)
    }
}

/// Raw byte-stream sessions, no shell semantics
#[derive(Clone)]
pub struct RawStreamHandler {
    backend: Arc<dyn Backend>,
}

impl RawStreamHandler {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    async fn connect(
        &self,
        session_id: &str,
        chain: &ResolvedChain,
    ) -> Result<BackendHandle, EngineError> {
        debug!(
            "Raw stream connect for session {} to {}:{}",
            session_id,
            chain.leaf().host,
            chain.leaf().port
        );
        self.backend
            .connect(ConnectionKind::RawStream, chain, session_id)
            .await
            .map_err(normalize)
    }
}

/// Translate backend-specific failures into the shared taxonomy
fn normalize(err: BackendError) -> EngineError {
    match err {
        BackendError::Unreachable(msg) => EngineError::Connection(msg),
        BackendError::Timeout(msg) => EngineError::Timeout(msg),
        BackendError::AuthRejected(msg) => EngineError::AuthRejected(msg),
        BackendError::Protocol(msg) => EngineError::Backend(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn backend_errors_normalize_into_taxonomy() {
        let err = normalize(BackendError::Unreachable("no route".to_string()));
        assert_eq!(err.class(), ErrorClass::Network);

        let err = normalize(BackendError::AuthRejected("bad key".to_string()));
        assert_eq!(err.class(), ErrorClass::Auth);

        let err = normalize(BackendError::Timeout("no banner".to_string()));
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
