//! Auto-reconnect engine
//!
//! Drives reconnection for failed sessions with exponential backoff,
//! gated on network availability. At most one reconnect loop is active
//! per session (single-flight); a new failure while one is in flight is
//! absorbed by the existing loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::network::NetworkMonitor;

/// How often cancellable waits re-check the cancellation flag
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Engine-level reconnect configuration, derived from `EnginePolicy`
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum time to wait for the network before giving up the episode
    pub offline_wait: Duration,
    /// Whether authentication rejections count as retriable
    pub retry_on_auth_rejection: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            offline_wait: Duration::from_secs(120),
            retry_on_auth_rejection: true,
        }
    }
}

/// Events emitted during reconnection, for the UI layer
#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    Starting {
        session_id: String,
    },
    WaitingForNetwork {
        session_id: String,
    },
    Waiting {
        session_id: String,
        delay_ms: u64,
        attempt: u32,
    },
    Attempting {
        session_id: String,
        attempt: u32,
        max_attempts: u32,
    },
    AttemptFailed {
        session_id: String,
        attempt: u32,
        error: String,
    },
    Success {
        session_id: String,
        attempt: u32,
    },
    Failed {
        session_id: String,
        total_attempts: u32,
    },
    Cancelled {
        session_id: String,
    },
}

/// Observable reconnect state for one session
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconnectSnapshot {
    pub is_reconnecting: bool,
    pub attempt_count: u32,
    pub next_delay_ms: u64,
}

/// Errors ending a reconnect episode
#[derive(Error, Debug, Clone)]
pub enum ReconnectError {
    #[error("auto-reconnect is disabled for this host")]
    Disabled,

    #[error("reconnection was cancelled")]
    Cancelled,

    #[error("a reconnect loop is already active for session {0}")]
    AlreadyReconnecting(String),

    #[error("maximum reconnection attempts ({0}) reached")]
    MaxAttemptsReached(u32),

    #[error("network unavailable")]
    NetworkUnavailable,

    /// Non-retriable error ended the episode early
    #[error("fatal error: {0}")]
    Fatal(EngineError),
}

#[derive(Default)]
struct ReconnectTask {
    attempt_count: AtomicU32,
    next_delay_ms: AtomicU64,
    cancelled: AtomicBool,
}

/// Per-session reconnect orchestration
///
/// Constructed once by the composition root with a handle to the network
/// monitor; never a module-level global.
pub struct AutoReconnectEngine {
    tasks: DashMap<String, Arc<ReconnectTask>>,
    network: Arc<NetworkMonitor>,
    config: ReconnectConfig,
    event_tx: Option<mpsc::Sender<ReconnectEvent>>,
}

impl AutoReconnectEngine {
    pub fn new(network: Arc<NetworkMonitor>, config: ReconnectConfig) -> Self {
        Self {
            tasks: DashMap::new(),
            network,
            config,
            event_tx: None,
        }
    }

    /// Set event sender for monitoring reconnection progress
    pub fn with_event_sender(mut self, tx: mpsc::Sender<ReconnectEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Whether a reconnect loop is active for this session
    pub fn is_reconnecting(&self, session_id: &str) -> bool {
        self.tasks.contains_key(session_id)
    }

    /// Attempts made in the current episode (0 when idle)
    pub fn attempt_count(&self, session_id: &str) -> u32 {
        self.tasks
            .get(session_id)
            .map(|t| t.attempt_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn snapshot(&self, session_id: &str) -> ReconnectSnapshot {
        match self.tasks.get(session_id) {
            Some(task) => ReconnectSnapshot {
                is_reconnecting: true,
                attempt_count: task.attempt_count.load(Ordering::SeqCst),
                next_delay_ms: task.next_delay_ms.load(Ordering::SeqCst),
            },
            None => ReconnectSnapshot::default(),
        }
    }

    /// Cancel the active loop for a session, if any. The loop observes
    /// the flag at its next suspension point.
    pub fn cancel(&self, session_id: &str) {
        if let Some(task) = self.tasks.get(session_id) {
            info!("Cancelling reconnection for session {}", session_id);
            task.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Run the reconnect loop for one failed session.
    ///
    /// `connect_fn` performs one full fresh connect (re-resolving the
    /// chain) and is invoked once per attempt. Single-flight: if a loop is
    /// already active for this session the call returns immediately.
    pub async fn run<F, Fut>(
        &self,
        session_id: &str,
        policy: &RetryPolicy,
        mut connect_fn: F,
    ) -> Result<(), ReconnectError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        if !policy.auto_reconnect || policy.max_attempts == 0 {
            return Err(ReconnectError::Disabled);
        }

        let task = Arc::new(ReconnectTask::default());
        match self.tasks.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ReconnectError::AlreadyReconnecting(session_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&task));
            }
        }
        let _flight = FlightGuard {
            tasks: &self.tasks,
            session_id,
        };

        self.emit(ReconnectEvent::Starting {
            session_id: session_id.to_string(),
        })
        .await;

        let max_attempts = policy.max_attempts;

        for attempt in 1..=max_attempts {
            if task.cancelled.load(Ordering::SeqCst) {
                return self.cancelled(session_id).await;
            }

            // Backoff wait (none before the first attempt)
            if attempt > 1 {
                let delay = backoff_delay(policy, attempt);
                task.next_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);

                self.emit(ReconnectEvent::Waiting {
                    session_id: session_id.to_string(),
                    delay_ms: delay.as_millis() as u64,
                    attempt,
                })
                .await;

                info!(
                    "Session {}: waiting {}ms before reconnect attempt {}/{}",
                    session_id,
                    delay.as_millis(),
                    attempt,
                    max_attempts
                );

                if !self.cancellable_sleep(&task, delay).await {
                    return self.cancelled(session_id).await;
                }
            }

            // Network gate after the backoff wait: an offline window never
            // consumes an attempt, and restoration resumes immediately
            // without re-counting the delay already elapsed
            if !self.network.is_online() {
                self.emit(ReconnectEvent::WaitingForNetwork {
                    session_id: session_id.to_string(),
                })
                .await;

                info!("Session {}: offline, waiting for network", session_id);
                match self.wait_for_network(&task).await {
                    NetworkWait::Online => {}
                    NetworkWait::Cancelled => return self.cancelled(session_id).await,
                    NetworkWait::TimedOut => {
                        warn!(
                            "Session {}: network did not return within {:?}",
                            session_id, self.config.offline_wait
                        );
                        return Err(ReconnectError::NetworkUnavailable);
                    }
                }
            }

            if task.cancelled.load(Ordering::SeqCst) {
                return self.cancelled(session_id).await;
            }

            // A real connect attempt is about to be made; only now does
            // the attempt counter move
            task.attempt_count.store(attempt, Ordering::SeqCst);

            self.emit(ReconnectEvent::Attempting {
                session_id: session_id.to_string(),
                attempt,
                max_attempts,
            })
            .await;

            info!(
                "Session {}: reconnection attempt {}/{}",
                session_id, attempt, max_attempts
            );

            match connect_fn(attempt).await {
                Ok(()) => {
                    self.emit(ReconnectEvent::Success {
                        session_id: session_id.to_string(),
                        attempt,
                    })
                    .await;
                    info!(
                        "Session {}: reconnection successful on attempt {}",
                        session_id, attempt
                    );
                    return Ok(());
                }
                Err(EngineError::Cancelled) => {
                    return self.cancelled(session_id).await;
                }
                Err(e) if !e.is_retriable(self.config.retry_on_auth_rejection) => {
                    error!(
                        "Session {}: non-retriable error during reconnect: {}",
                        session_id, e
                    );
                    self.emit(ReconnectEvent::Failed {
                        session_id: session_id.to_string(),
                        total_attempts: attempt,
                    })
                    .await;
                    return Err(ReconnectError::Fatal(e));
                }
                Err(e) => {
                    warn!(
                        "Session {}: reconnection attempt {} failed: {}",
                        session_id, attempt, e
                    );
                    self.emit(ReconnectEvent::AttemptFailed {
                        session_id: session_id.to_string(),
                        attempt,
                        error: e.to_string(),
                    })
                    .await;
                }
            }
        }

        self.emit(ReconnectEvent::Failed {
            session_id: session_id.to_string(),
            total_attempts: max_attempts,
        })
        .await;

        error!(
            "Session {}: reconnection failed after {} attempts",
            session_id, max_attempts
        );
        Err(ReconnectError::MaxAttemptsReached(max_attempts))
    }

    async fn cancelled(&self, session_id: &str) -> Result<(), ReconnectError> {
        self.emit(ReconnectEvent::Cancelled {
            session_id: session_id.to_string(),
        })
        .await;
        info!("Session {}: reconnection cancelled", session_id);
        Err(ReconnectError::Cancelled)
    }

    /// Sleep in small increments so cancellation is observed promptly.
    /// Returns false if cancelled.
    async fn cancellable_sleep(&self, task: &ReconnectTask, delay: Duration) -> bool {
        let mut elapsed = Duration::ZERO;
        while elapsed < delay {
            if task.cancelled.load(Ordering::SeqCst) {
                return false;
            }
            let step = CANCEL_POLL.min(delay - elapsed);
            sleep(step).await;
            elapsed += step;
        }
        !task.cancelled.load(Ordering::SeqCst)
    }

    async fn wait_for_network(&self, task: &ReconnectTask) -> NetworkWait {
        let wait = self.network.wait_for_online(self.config.offline_wait);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                restored = &mut wait => {
                    return if restored { NetworkWait::Online } else { NetworkWait::TimedOut };
                }
                _ = sleep(CANCEL_POLL) => {
                    if task.cancelled.load(Ordering::SeqCst) {
                        return NetworkWait::Cancelled;
                    }
                }
            }
        }
    }

    async fn emit(&self, event: ReconnectEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

enum NetworkWait {
    Online,
    TimedOut,
    Cancelled,
}

/// Removes the single-flight entry on every exit path
struct FlightGuard<'a> {
    tasks: &'a DashMap<String, Arc<ReconnectTask>>,
    session_id: &'a str,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.tasks.remove(self.session_id);
    }
}

/// Exponential backoff with jitter, capped at the policy maximum
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay_ms as f64;
    let raw = base * policy.backoff_multiplier.powi(attempt as i32 - 2);
    let capped = raw.min(policy.max_delay_ms as f64);
    // Up to 10% jitter to keep herds of sessions from retrying in lockstep
    let jitter = capped * rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_millis((capped + jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn policy(max_attempts: u32, base_delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            auto_reconnect: true,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = policy(5, 1000);

        // Attempt 2 waits roughly the base delay, attempt 3 roughly double
        let d2 = backoff_delay(&policy, 2);
        assert!(d2 >= Duration::from_millis(1000) && d2 < Duration::from_millis(1200));
        let d3 = backoff_delay(&policy, 3);
        assert!(d3 >= Duration::from_millis(2000) && d3 < Duration::from_millis(2400));

        // Far attempts are capped at max_delay (plus jitter)
        let d20 = backoff_delay(&policy, 20);
        assert!(d20 <= Duration::from_millis(33_000));
    }

    #[tokio::test]
    async fn exhausts_budget_then_stops() {
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = AutoReconnectEngine::new(network, ReconnectConfig::default());
        let calls = AtomicU32::new(0);

        let err = engine
            .run("s1", &policy(3, 1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Connection("refused".to_string())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReconnectError::MaxAttemptsReached(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!engine.is_reconnecting("s1"));
    }

    #[tokio::test]
    async fn succeeds_midway_and_clears_state() {
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = AutoReconnectEngine::new(network, ReconnectConfig::default());
        let calls = AtomicU32::new(0);

        engine
            .run("s1", &policy(5, 1), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(EngineError::Connection("refused".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!engine.is_reconnecting("s1"));
    }

    #[tokio::test]
    async fn disabled_policy_never_runs() {
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = AutoReconnectEngine::new(network, ReconnectConfig::default());

        let mut p = policy(3, 1);
        p.auto_reconnect = false;
        let err = engine
            .run("s1", &p, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconnectError::Disabled));
    }

    #[tokio::test]
    async fn non_retriable_error_ends_episode() {
        let network = Arc::new(NetworkMonitor::new(true));
        let config = ReconnectConfig {
            retry_on_auth_rejection: false,
            ..Default::default()
        };
        let engine = AutoReconnectEngine::new(network, config);
        let calls = AtomicU32::new(0);

        let err = engine
            .run("s1", &policy(5, 1), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::AuthRejected("denied".to_string())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReconnectError::Fatal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offline_consumes_no_attempts() {
        let network = Arc::new(NetworkMonitor::new(false));
        let config = ReconnectConfig {
            offline_wait: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = Arc::new(AutoReconnectEngine::new(Arc::clone(&network), config));
        let calls = Arc::new(AtomicU32::new(0));

        let run = {
            let engine = Arc::clone(&engine);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                engine
                    .run("s1", &policy(3, 1), move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok(()) }
                    })
                    .await
            })
        };

        // While offline, no attempt is made and no budget is consumed
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.attempt_count("s1"), 0);
        assert!(engine.is_reconnecting("s1"));

        // Restoration resumes the pending attempt immediately
        network.set_online(true);
        run.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_during_backoff_prevents_next_attempt() {
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = Arc::new(AutoReconnectEngine::new(
            network,
            ReconnectConfig::default(),
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let run = {
            let engine = Arc::clone(&engine);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                engine
                    .run("s1", &policy(5, 5000), move |_| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err(EngineError::Connection("refused".to_string())) }
                    })
                    .await
            })
        };

        // First attempt fails immediately, then the loop enters its long
        // backoff wait; cancel there
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.cancel("s1");

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ReconnectError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!engine.is_reconnecting("s1"));
    }

    #[tokio::test]
    async fn single_flight_per_session() {
        let network = Arc::new(NetworkMonitor::new(true));
        let engine = Arc::new(AutoReconnectEngine::new(
            network,
            ReconnectConfig::default(),
        ));

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .run("s1", &policy(5, 2000), |_| async {
                        Err(EngineError::Connection("refused".to_string()))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.is_reconnecting("s1"));

        // A second loop for the same session is refused
        let err = engine
            .run("s1", &policy(5, 1), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconnectError::AlreadyReconnecting(_)));

        engine.cancel("s1");
        let _ = first.await.unwrap();
    }
}
