//! Connection engine facade
//!
//! Owns the session registry, chain resolver, handler factory, and
//! auto-reconnect engine, and exposes the intents the UI layer issues:
//! connect, retry, cancel, close, plus per-session observables.
//!
//! Data flow: an intent resolves the chain and builds a handler, the
//! handler executes against the backend, the state machine reflects the
//! result, the heartbeat monitor watches the live session, and on failure
//! the reconnect engine re-drives the same path until success,
//! cancellation, or budget exhaustion.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendEvent, BackendHandle};
use crate::catalog::HostCatalog;
use crate::chain::ChainResolver;
use crate::config::{EnginePolicy, HostConfig};
use crate::error::{EngineError, LastError};
use crate::handler::{ConnectionHandler, HandlerFactory};
use crate::network::NetworkMonitor;
use crate::session::{
    spawn_heartbeat, AutoReconnectEngine, ConnectionState, HealthMetrics, HealthTracker,
    ReconnectConfig, ReconnectError, ReconnectEvent, ReconnectSnapshot, RegistryError,
    SessionInfo, SessionRegistry, SessionStats,
};

/// Capacity of the internal liveness-loss notification channel
const LIVENESS_CHANNEL_CAPACITY: usize = 64;

/// How often an in-flight connect re-checks that it is still the current
/// attempt for its session
const STALE_POLL: Duration = Duration::from_millis(100);

/// Top-level engine, one per application
pub struct ConnectionEngine {
    registry: Arc<SessionRegistry>,
    resolver: ChainResolver,
    factory: HandlerFactory,
    reconnect: Arc<AutoReconnectEngine>,
    network: Arc<NetworkMonitor>,
    policy: EnginePolicy,
    liveness_tx: mpsc::Sender<String>,
}

impl ConnectionEngine {
    /// Construct the engine with its collaborators. The network monitor is
    /// injected by the composition root and shared with whatever feeds it
    /// connectivity changes.
    pub fn new(
        backend: Arc<dyn Backend>,
        catalog: Arc<dyn HostCatalog>,
        network: Arc<NetworkMonitor>,
        policy: EnginePolicy,
    ) -> Arc<Self> {
        Self::with_reconnect_events(backend, catalog, network, policy, None)
    }

    /// Same as `new`, with a channel receiving reconnect progress events
    /// for the UI layer
    pub fn with_reconnect_events(
        backend: Arc<dyn Backend>,
        catalog: Arc<dyn HostCatalog>,
        network: Arc<NetworkMonitor>,
        policy: EnginePolicy,
        reconnect_events: Option<mpsc::Sender<ReconnectEvent>>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(policy.max_sessions));
        let reconnect_config = ReconnectConfig {
            offline_wait: policy.offline_wait(),
            retry_on_auth_rejection: policy.retry_on_auth_rejection,
        };
        let mut reconnect = AutoReconnectEngine::new(Arc::clone(&network), reconnect_config);
        if let Some(tx) = reconnect_events {
            reconnect = reconnect.with_event_sender(tx);
        }

        let (liveness_tx, liveness_rx) = mpsc::channel(LIVENESS_CHANNEL_CAPACITY);
        let backend_events = backend.subscribe();

        let engine = Arc::new(Self {
            registry,
            resolver: ChainResolver::new(catalog),
            factory: HandlerFactory::new(backend),
            reconnect: Arc::new(reconnect),
            network,
            policy,
            liveness_tx,
        });

        Self::spawn_liveness_dispatch(Arc::downgrade(&engine), liveness_rx);
        Self::spawn_event_pump(Arc::downgrade(&engine), backend_events);
        engine
    }

    // ---- UI intents ----

    /// Open a session for `config` and start connecting. Returns the
    /// session id immediately; progress is observable via
    /// `connection_state` and the reconnect observables.
    pub fn connect(self: &Arc<Self>, config: HostConfig) -> Result<String, EngineError> {
        let session_id = self.registry.create_session(config).map_err(reg_err)?;
        self.spawn_connect(session_id.clone());
        Ok(session_id)
    }

    /// Explicit user retry of a Failed/Timeout (or Disconnected) session.
    /// Invalidates any outstanding reconnect loop first.
    pub fn retry(self: &Arc<Self>, session_id: &str) -> Result<(), EngineError> {
        if !self.registry.contains(session_id) {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        self.reconnect.cancel(session_id);
        self.spawn_connect(session_id.to_string());
        Ok(())
    }

    /// Cancel whatever the session is doing and leave it Disconnected.
    /// The session remains addressable; `retry` can bring it back.
    pub async fn cancel(&self, session_id: &str) -> Result<(), EngineError> {
        // Order matters: flag the reconnect loop before touching state so
        // the loop observes the cancellation at its next suspension point
        self.reconnect.cancel(session_id);
        let outcome = self.registry.cancel(session_id).map_err(reg_err)?;
        if let Some(handle) = outcome.handle {
            if let Ok(handler) = self.handler_for(session_id) {
                handler.disconnect(handle).await;
            }
        }
        Ok(())
    }

    /// Close a session in any state: disconnect the handler, cancel any
    /// in-flight reconnect, release resources, forget the session.
    pub async fn close(&self, session_id: &str) -> Result<(), EngineError> {
        self.reconnect.cancel(session_id);
        let entry = self
            .registry
            .remove(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        if let Some(handle) = entry.handle {
            let handler = self.factory.create(entry.config.kind);
            handler.disconnect(handle).await;
        }
        info!("Session {} closed", session_id);
        Ok(())
    }

    // ---- Observables ----

    pub fn connection_state(&self, session_id: &str) -> Result<ConnectionState, EngineError> {
        self.registry.state(session_id).map_err(reg_err)
    }

    pub fn last_error(&self, session_id: &str) -> Result<Option<LastError>, EngineError> {
        self.registry.last_error(session_id).map_err(reg_err)
    }

    pub fn is_reconnecting(&self, session_id: &str) -> bool {
        self.reconnect.is_reconnecting(session_id)
    }

    pub fn reconnect_attempts(&self, session_id: &str) -> u32 {
        self.reconnect.attempt_count(session_id)
    }

    pub fn reconnect_snapshot(&self, session_id: &str) -> ReconnectSnapshot {
        self.reconnect.snapshot(session_id)
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfo, EngineError> {
        self.registry
            .info(
                session_id,
                self.is_reconnecting(session_id),
                self.reconnect_attempts(session_id),
            )
            .map_err(reg_err)
    }

    pub fn health(&self, session_id: &str) -> Result<Option<HealthMetrics>, EngineError> {
        Ok(self
            .registry
            .health(session_id)
            .map_err(reg_err)?
            .map(|tracker| tracker.metrics()))
    }

    pub fn stats(&self) -> SessionStats {
        self.registry.stats()
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    // ---- Attempt execution ----

    fn spawn_connect(self: &Arc<Self>, session_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let (generation, superseded) = match this.registry.begin_attempt(&session_id) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Session {}: connect not started: {}", session_id, e);
                    return;
                }
            };
            this.release_superseded(&session_id, superseded).await;

            match this.run_attempt(&session_id, generation).await {
                Ok(()) => {}
                Err(EngineError::Cancelled) => {}
                Err(e) => this.maybe_start_reconnect(&session_id, &e),
            }
        });
    }

    /// One full connection attempt for `generation`: re-resolve the chain,
    /// connect through the handler, apply the outcome. Credential material
    /// lives exactly as long as the attempt.
    async fn run_attempt(&self, session_id: &str, generation: u64) -> Result<(), EngineError> {
        let config = match self.registry.config(session_id) {
            Ok(config) => config,
            // Session closed while we were scheduled; nothing to apply
            Err(_) => return Err(EngineError::Cancelled),
        };
        let handler = self.factory.create(config.kind);

        // Chains are rebuilt every attempt; catalog edits apply on retry
        let chain = match self.resolver.resolve(&config.chain, &config) {
            Ok(chain) => chain,
            Err(e) => {
                let err = EngineError::from(e);
                self.apply_failure(session_id, generation, &err);
                return Err(err);
            }
        };
        let credentials = chain.credentials();

        // Cancellation check before any network IO
        if self.registry.generation(session_id).ok() != Some(generation) {
            credentials.cleanup();
            return Err(EngineError::Cancelled);
        }

        let result = {
            let connect = tokio::time::timeout(
                self.policy.connect_timeout(),
                handler.connect(session_id, &chain),
            );
            tokio::pin!(connect);

            // Watch the generation while the connect runs: a cancel or close
            // drops the attempt at the next poll instead of at the deadline
            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    _ = tokio::time::sleep(STALE_POLL) => {
                        if self.registry.generation(session_id).ok() != Some(generation) {
                            break None;
                        }
                    }
                }
            }
        };

        // The backend needed the material only while connecting; destroy
        // it now, success or not
        credentials.cleanup();

        let Some(result) = result else {
            debug!("Session {}: dropping superseded connect attempt", session_id);
            return Err(EngineError::Cancelled);
        };

        match result {
            Err(_elapsed) => {
                let err = EngineError::Timeout(format!(
                    "no response within {}ms",
                    self.policy.connect_timeout_ms
                ));
                if self
                    .registry
                    .timeout_attempt(session_id, generation, LastError::from(&err))
                    .is_err()
                {
                    return Err(EngineError::Cancelled);
                }
                Err(err)
            }
            Ok(Err(err)) => {
                if !self.apply_failure(session_id, generation, &err) {
                    return Err(EngineError::Cancelled);
                }
                Err(err)
            }
            Ok(Ok(handle)) => self.install_session(session_id, generation, handler, handle, &config).await,
        }
    }

    /// Publish a successful connect: state to Connected/Ready, start the
    /// heartbeat monitor. A stale success (session closed, cancelled, or
    /// re-connected since) releases the handle instead of applying it.
    async fn install_session(
        &self,
        session_id: &str,
        generation: u64,
        handler: ConnectionHandler,
        handle: BackendHandle,
        config: &HostConfig,
    ) -> Result<(), EngineError> {
        let health = Arc::new(HealthTracker::default());
        match self
            .registry
            .complete_attempt(session_id, generation, handle, Arc::clone(&health))
        {
            Ok(()) => {
                let guard = spawn_heartbeat(
                    Arc::clone(&self.registry),
                    handler,
                    session_id.to_string(),
                    generation,
                    handle,
                    config.keepalive_interval(),
                    health,
                    self.liveness_tx.clone(),
                );
                // If we lost a race with cancel/close, the registry stops
                // the guard for us
                let _ = self.registry.set_heartbeat(session_id, generation, guard);
                Ok(())
            }
            Err(e) => {
                debug!(
                    "Session {}: discarding stale connect result: {}",
                    session_id, e
                );
                handler.disconnect(handle).await;
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Record a failed attempt in the state machine. Returns false if the
    /// result was stale and must be discarded.
    fn apply_failure(&self, session_id: &str, generation: u64, err: &EngineError) -> bool {
        self.registry
            .fail_attempt(session_id, generation, LastError::from(err))
            .is_ok()
    }

    // ---- Reconnection ----

    fn maybe_start_reconnect(self: &Arc<Self>, session_id: &str, err: &EngineError) {
        let Ok(config) = self.registry.config(session_id) else {
            return;
        };
        if !config.retry.auto_reconnect {
            return;
        }
        if !err.is_retriable(self.policy.retry_on_auth_rejection) {
            debug!(
                "Session {}: not auto-reconnecting after non-retriable error: {}",
                session_id, err
            );
            return;
        }
        self.start_reconnect(session_id.to_string());
    }

    fn start_reconnect(self: &Arc<Self>, session_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(config) = this.registry.config(&session_id) else {
                return;
            };
            let policy = config.retry.clone();

            let engine = Arc::clone(&this);
            let id = session_id.clone();
            let result = this
                .reconnect
                .run(&session_id, &policy, move |_attempt| {
                    let engine = Arc::clone(&engine);
                    let id = id.clone();
                    async move {
                        let (generation, superseded) =
                            engine.registry.begin_attempt(&id).map_err(|_| {
                                // Closed or in a non-retryable state: the
                                // episode is over for this loop
                                EngineError::Cancelled
                            })?;
                        engine.release_superseded(&id, superseded).await;
                        engine.run_attempt(&id, generation).await
                    }
                })
                .await;

            match result {
                Ok(())
                | Err(ReconnectError::Cancelled)
                | Err(ReconnectError::Disabled)
                | Err(ReconnectError::AlreadyReconnecting(_)) => {}
                Err(e) => {
                    // Budget exhausted or fatal: the session stays Failed
                    // with its last error; terminal-for-now for the UI
                    warn!("Session {}: reconnection ended: {}", session_id, e);
                }
            }
        });
    }

    // ---- Internal plumbing ----

    /// A session must never hold two live backend handles; anything a new
    /// attempt displaced is released here
    async fn release_superseded(&self, session_id: &str, superseded: Option<BackendHandle>) {
        if let Some(handle) = superseded {
            debug!("Session {}: releasing superseded handle", session_id);
            if let Ok(handler) = self.handler_for(session_id) {
                handler.disconnect(handle).await;
            }
        }
    }

    fn handler_for(&self, session_id: &str) -> Result<ConnectionHandler, EngineError> {
        let config = self.registry.config(session_id).map_err(reg_err)?;
        Ok(self.factory.create(config.kind))
    }

    /// Consumes liveness-loss notifications from heartbeat monitors and
    /// starts reconnection for the affected session
    fn spawn_liveness_dispatch(engine: Weak<Self>, mut rx: mpsc::Receiver<String>) {
        tokio::spawn(async move {
            while let Some(session_id) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                debug!("Liveness lost for session {}, evaluating reconnect", session_id);
                let err = EngineError::Connection("liveness lost".to_string());
                engine.maybe_start_reconnect(&session_id, &err);
            }
        });
    }

    /// Maps backend lifecycle events onto session state
    fn spawn_event_pump(engine: Weak<Self>, mut rx: broadcast::Receiver<BackendEvent>) {
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Backend event stream lagged by {} events", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                engine.handle_backend_event(event);
            }
        });
    }

    fn handle_backend_event(self: &Arc<Self>, event: BackendEvent) {
        match event {
            // Output rendering belongs to the UI layer
            BackendEvent::Output { .. } => {}
            BackendEvent::AuthStarted { session_id } => {
                if let Ok(generation) = self.registry.generation(&session_id) {
                    let _ = self.registry.mark_authenticating(&session_id, generation);
                }
            }
            BackendEvent::Exit {
                session_id,
                code,
                reason,
            } => {
                let Ok(state) = self.registry.state(&session_id) else {
                    return;
                };
                if !state.is_live() {
                    return;
                }
                let Ok(generation) = self.registry.generation(&session_id) else {
                    return;
                };
                let err = EngineError::Connection(format!(
                    "remote exited (code {:?}): {}",
                    code, reason
                ));
                if self.apply_failure(&session_id, generation, &err) {
                    self.maybe_start_reconnect(&session_id, &err);
                }
            }
            BackendEvent::Error {
                session_id,
                message,
            } => {
                let Ok(state) = self.registry.state(&session_id) else {
                    return;
                };
                if !state.is_live() {
                    return;
                }
                let Ok(generation) = self.registry.generation(&session_id) else {
                    return;
                };
                let err = EngineError::Backend(message);
                if self.apply_failure(&session_id, generation, &err) {
                    self.maybe_start_reconnect(&session_id, &err);
                }
            }
        }
    }
}

fn reg_err(e: RegistryError) -> EngineError {
    match e {
        RegistryError::SessionNotFound(id) => EngineError::SessionNotFound(id),
        RegistryError::LimitReached { .. } => EngineError::Config(e.to_string()),
        // Stale or illegal transitions mean the work was superseded
        RegistryError::State(_) | RegistryError::Stale(_) => EngineError::Cancelled,
    }
}
