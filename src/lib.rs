//! hoplink: connection lifecycle and resilience engine for multi-session
//! remote clients.
//!
//! The crate manages the full lifecycle of remote sessions (shell, file
//! transfer, raw stream): resolving multi-hop connection chains with
//! ephemeral credential material, driving a per-session state machine,
//! monitoring liveness with periodic probes, and reconnecting failed
//! sessions with exponential backoff gated on network availability.
//!
//! The wire protocol itself lives behind the [`backend::Backend`] trait;
//! the engine composes everything above it. Typical wiring:
//!
//! ```ignore
//! let network = Arc::new(NetworkMonitor::new(true));
//! let engine = ConnectionEngine::new(backend, catalog, network, EnginePolicy::default());
//! let session_id = engine.connect(host_config)?;
//! ```

pub mod backend;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod network;
pub mod session;

pub use backend::{Backend, BackendError, BackendEvent, BackendHandle, Liveness};
pub use catalog::{HostCatalog, MemoryCatalog};
pub use config::{AuthMethod, ConnectionKind, EnginePolicy, HostConfig, HostId, RetryPolicy};
pub use engine::ConnectionEngine;
pub use error::{ChainError, EngineError, ErrorClass, LastError};
pub use network::NetworkMonitor;
pub use session::{
    ConnectionState, HealthMetrics, HealthStatus, ReconnectEvent, ReconnectSnapshot, SessionInfo,
    SessionStats,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for binaries embedding the engine.
///
/// Respects `RUST_LOG`; defaults to `info`. Call once at startup.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
