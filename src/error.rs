//! Engine error taxonomy
//!
//! All component-level failures are normalized into `EngineError` before
//! they reach the session state machine. The state machine never returns
//! these as panics; failures become a state transition plus a structured
//! `LastError` the UI layer renders.

use serde::Serialize;
use thiserror::Error;

use crate::config::HostId;

/// Errors from chain resolution
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("Unknown host in chain: {0}")]
    UnknownHost(HostId),

    #[error("Failed to materialize credentials for {host}: {cause}")]
    CredentialMaterialization { host: HostId, cause: String },

    #[error("Host {0} appears more than once in chain")]
    CycleDetected(HostId),
}

/// Shared error taxonomy for the engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Bad configuration; surfaced before any network IO, never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chain resolution failure
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Network-level connection failure
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Connect attempt exceeded its deadline
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// The remote rejected our authentication
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Backend reported a protocol-level failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// The operation was cancelled; a first-class outcome, not a failure
    #[error("Cancelled")]
    Cancelled,

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// Coarse classification used for retry decisions and UI rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Config,
    Credential,
    Network,
    Auth,
    Cancelled,
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::SessionNotFound(_) => ErrorClass::Config,
            Self::Chain(ChainError::UnknownHost(_)) | Self::Chain(ChainError::CycleDetected(_)) => {
                ErrorClass::Config
            }
            Self::Chain(ChainError::CredentialMaterialization { .. }) => ErrorClass::Credential,
            Self::Connection(_) | Self::Timeout(_) | Self::Backend(_) => ErrorClass::Network,
            Self::AuthRejected(_) => ErrorClass::Auth,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether the auto-reconnect engine may retry after this error.
    ///
    /// Credential materialization is fatal for the current attempt but
    /// retriable as part of a full reconnect cycle, since material is
    /// re-materialized fresh on every attempt. Authentication rejection is
    /// policy-dependent.
    pub fn is_retriable(&self, retry_on_auth_rejection: bool) -> bool {
        match self.class() {
            ErrorClass::Config | ErrorClass::Cancelled => false,
            ErrorClass::Credential | ErrorClass::Network => true,
            ErrorClass::Auth => retry_on_auth_rejection,
        }
    }
}

/// Structured last-error stored on a session after a failed attempt
#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&EngineError> for LastError {
    fn from(err: &EngineError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

// Make EngineError serializable for UI-facing command results
impl Serialize for EngineError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
