//! Session connection state machine
//!
//! Exactly one session owns its state value at any time; all transitions
//! go through the guarded methods here, so two competing writers can never
//! race on the state. Invalid transitions are errors, never panics.
//!
//! ```text
//! Disconnected --connect--> Connecting
//! Connecting --auth-required--> Authenticating
//! Connecting/Authenticating --success--> Connected --confirm--> Ready
//! Connecting/Authenticating --failure--> Failed
//! Connecting --deadline--> Timeout
//! Connected/Ready --liveness-lost--> Failed
//! any --user-cancel--> Disconnected
//! Failed/Timeout --retry--> Connecting
//! ```

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LastError;

/// Connection lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Ready,
    /// Terminal for the current attempt only; retryable
    Failed,
    /// Connect deadline elapsed; terminal for the current attempt only
    Timeout,
}

impl ConnectionState {
    /// States with a live backend handle
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// States an attempt is in flight
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating)
    }

    /// Terminal with respect to the current attempt, retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

/// Invalid state transition
#[derive(Error, Debug, Clone)]
#[error("invalid transition: {event} from {from:?}")]
pub struct StateError {
    pub from: ConnectionState,
    pub event: &'static str,
}

/// Per-session state holder
///
/// Serializes transitions behind a lock; the generation checks that gate
/// stale writers live in the registry, one level up.
pub struct SessionStateMachine {
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<LastError>>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_error: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.read().clone()
    }

    /// `connect` / `retry`: start a fresh attempt
    pub fn start_connecting(&self) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Timeout => {
                *state = ConnectionState::Connecting;
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "connect",
            }),
        }
    }

    /// The backend asked for authentication
    pub fn auth_started(&self) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Connecting => {
                *state = ConnectionState::Authenticating;
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "auth-required",
            }),
        }
    }

    /// The attempt produced a live handle
    pub fn connect_success(&self) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                *state = ConnectionState::Connected;
                *self.last_error.write() = None;
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "success",
            }),
        }
    }

    /// The backend confirmed the session is interactive
    pub fn mark_ready(&self) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Connected => {
                *state = ConnectionState::Ready;
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "ready",
            }),
        }
    }

    /// Attempt failure or liveness loss
    pub fn fail(&self, error: LastError) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Connected
            | ConnectionState::Ready => {
                *state = ConnectionState::Failed;
                *self.last_error.write() = Some(error);
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "failure",
            }),
        }
    }

    /// Connect deadline elapsed with no response
    pub fn timeout(&self, error: LastError) -> Result<(), StateError> {
        let mut state = self.state.write();
        match *state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                *state = ConnectionState::Timeout;
                *self.last_error.write() = Some(error);
                Ok(())
            }
            from => Err(StateError {
                from,
                event: "timeout",
            }),
        }
    }

    /// User cancellation; legal from any state and clears the last error.
    /// Cancellation is not a failure, so nothing is recorded for the UI.
    pub fn cancel(&self) {
        *self.state.write() = ConnectionState::Disconnected;
        *self.last_error.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    fn net_error() -> LastError {
        LastError {
            class: ErrorClass::Network,
            message: "connection reset".to_string(),
        }
    }

    #[test]
    fn happy_path_walks_defined_edges() {
        let sm = SessionStateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        sm.start_connecting().unwrap();
        sm.auth_started().unwrap();
        sm.connect_success().unwrap();
        sm.mark_ready().unwrap();
        assert_eq!(sm.state(), ConnectionState::Ready);
        assert!(sm.last_error().is_none());
    }

    #[test]
    fn no_success_from_terminal_state_without_connecting() {
        let sm = SessionStateMachine::new();
        sm.start_connecting().unwrap();
        sm.fail(net_error()).unwrap();

        // Failed -> Connected is not an edge
        assert!(sm.connect_success().is_err());
        assert_eq!(sm.state(), ConnectionState::Failed);

        // The retry edge goes back through Connecting
        sm.start_connecting().unwrap();
        sm.connect_success().unwrap();
        assert_eq!(sm.state(), ConnectionState::Connected);
    }

    #[test]
    fn liveness_loss_fails_a_ready_session() {
        let sm = SessionStateMachine::new();
        sm.start_connecting().unwrap();
        sm.connect_success().unwrap();
        sm.mark_ready().unwrap();

        sm.fail(net_error()).unwrap();
        assert_eq!(sm.state(), ConnectionState::Failed);
        assert_eq!(sm.last_error().unwrap().class, ErrorClass::Network);
    }

    #[test]
    fn timeout_only_from_in_flight_attempt() {
        let sm = SessionStateMachine::new();
        assert!(sm.timeout(net_error()).is_err());

        sm.start_connecting().unwrap();
        sm.timeout(net_error()).unwrap();
        assert_eq!(sm.state(), ConnectionState::Timeout);
        assert!(sm.state().is_retryable());
    }

    #[test]
    fn cancel_is_legal_from_any_state() {
        let sm = SessionStateMachine::new();
        sm.cancel();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        sm.start_connecting().unwrap();
        sm.cancel();
        assert_eq!(sm.state(), ConnectionState::Disconnected);

        sm.start_connecting().unwrap();
        sm.fail(net_error()).unwrap();
        sm.cancel();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert!(sm.last_error().is_none());
    }

    #[test]
    fn success_clears_previous_error() {
        let sm = SessionStateMachine::new();
        sm.start_connecting().unwrap();
        sm.fail(net_error()).unwrap();
        assert!(sm.last_error().is_some());

        sm.start_connecting().unwrap();
        sm.connect_success().unwrap();
        assert!(sm.last_error().is_none());
    }
}
