//! Heartbeat monitor
//!
//! One periodic probe task per live session. A failed probe transitions
//! the session to Failed, releases the dead handle, and notifies the
//! reconnect path exactly once per failure episode. The task stops when
//! the session leaves Connected/Ready for any reason (its guard is
//! aborted by the registry).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::health::HealthTracker;
use super::registry::SessionRegistry;
use crate::backend::{BackendHandle, Liveness};
use crate::error::{ErrorClass, LastError};
use crate::handler::ConnectionHandler;

/// Aborts the monitor task when stopped or dropped
pub struct HeartbeatGuard {
    task: JoinHandle<()>,
}

impl HeartbeatGuard {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the periodic liveness probe for one live session.
///
/// `generation` identifies the attempt that produced `handle`; if the
/// session has since been superseded the monitor exits without touching
/// state. On liveness loss the session id is sent on `liveness_tx` for
/// the reconnect path to pick up.
pub fn spawn_heartbeat(
    registry: Arc<SessionRegistry>,
    handler: ConnectionHandler,
    session_id: String,
    generation: u64,
    handle: BackendHandle,
    interval: Duration,
    health: Arc<HealthTracker>,
    liveness_tx: mpsc::Sender<String>,
) -> HeartbeatGuard {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so probing starts
        // one full interval after connect
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match registry.generation(&session_id) {
                Ok(current) if current == generation => {}
                _ => {
                    debug!("Heartbeat[{}]: superseded, exiting", session_id);
                    return;
                }
            }

            health.record_probe_sent();
            let started = Instant::now();
            let probe = tokio::time::timeout(interval, handler.probe(handle)).await;

            match probe {
                Ok(Liveness::Alive) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    health.record_probe_response(latency_ms);
                    debug!("Heartbeat[{}]: alive ({}ms)", session_id, latency_ms);
                }
                Ok(Liveness::Dead) | Err(_) => {
                    warn!("Heartbeat[{}]: liveness lost", session_id);
                    health.deactivate();

                    // Release the dead handle before touching state:
                    // fail_attempt aborts this task's own guard, so no
                    // await may follow it. Backend disconnect is
                    // idempotent, a racing cancel doing the same is fine.
                    handler.disconnect(handle).await;

                    let error = LastError {
                        class: ErrorClass::Network,
                        message: "liveness lost: keepalive probe failed".to_string(),
                    };
                    // If the failure does not apply, a concurrent cancel or
                    // retry already owns this episode and we notify no one.
                    // try_send, not send: fail_attempt aborted this task's
                    // own guard, so no await may follow it.
                    if registry.fail_attempt(&session_id, generation, error).is_ok() {
                        if let Err(e) = liveness_tx.try_send(session_id.clone()) {
                            warn!(
                                "Heartbeat[{}]: liveness notification dropped, \
                                 no reconnect will start automatically: {}",
                                session_id, e
                            );
                        }
                    }
                    return;
                }
            }
        }
    });

    HeartbeatGuard { task }
}
