//! Session management
//!
//! Per-session connection state machine, registry, heartbeat monitoring,
//! and the auto-reconnect engine.

pub mod health;
pub mod heartbeat;
mod reconnect;
mod registry;
mod state;
pub mod types;

pub use health::{HealthMetrics, HealthStatus, HealthThresholds, HealthTracker};
pub use heartbeat::{spawn_heartbeat, HeartbeatGuard};
pub use reconnect::{
    AutoReconnectEngine, ReconnectConfig, ReconnectError, ReconnectEvent, ReconnectSnapshot,
};
pub use registry::{CancelOutcome, RegistryError, SessionRegistry};
pub use state::{ConnectionState, SessionStateMachine, StateError};
pub use types::{SessionEntry, SessionInfo, SessionStats};
