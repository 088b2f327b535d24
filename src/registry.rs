//! Client registry
//!
//! The [`Registry`] is the caller-facing surface. It mints opaque handles, owns
//! every [`Session`], checks lifecycle guards before touching the engine, and
//! keeps the engine-identity map the [`EventBus`] routes by.
//!
//! # Locking
//!
//! The handle map and the engine-identity map share one `RwLock`. Each session
//! sits behind its own async mutex. Lookups release the map lock before a
//! session lock is taken; code holding a session lock may take the map lock.
//! The order is always session, then map.

use crate::bus::{Diagnostic, EventBus, EventKind, Listener, ListenerId, TaggedEvent};
use crate::config::{ConnectionOptions, RegistryConfig};
use crate::connection::normalize;
use crate::engine::{Engine, EngineError, EngineId, EventSink, QoS};
use crate::error::{SessionError, SessionResult};
use crate::lifecycle::{Lifecycle, LifecycleError, SessionState};
use crate::observability::metrics::{MetricsSnapshot, RegistryMetrics};
use crate::session::Session;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, oneshot, watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

const DIAGNOSTIC_CAPACITY: usize = 256;

/// Opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Handle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Handle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared reference to a live session
pub type SessionRef = Arc<Mutex<Session>>;

#[derive(Default)]
struct Maps {
    sessions: HashMap<Handle, SessionRef>,
    engine_ids: HashMap<EngineId, Handle>,
}

/// Registry of MQTT sessions sharing one engine
pub struct Registry {
    engine: Arc<dyn Engine>,
    sink: EventSink,
    config: RegistryConfig,
    maps: RwLock<Maps>,
    instance: String,
    next_seq: AtomicU64,
    diagnostics: broadcast::Sender<Diagnostic>,
    metrics: RegistryMetrics,
    /// Dropped with the registry, which stops the bus
    _bus_guard: watch::Sender<()>,
}

impl Registry {
    /// Build a registry and the bus that must be run for events to flow
    ///
    /// The bus only holds a weak reference; it stops once the last `Arc` to the
    /// registry is dropped.
    pub fn new(engine: Arc<dyn Engine>, config: RegistryConfig) -> (Arc<Self>, EventBus) {
        let (sink, rx) = EventSink::channel();
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        let (bus_guard, registry_dropped) = watch::channel(());
        let instance = Uuid::new_v4().simple().to_string()[..8].to_string();

        let registry = Arc::new(Self {
            engine,
            sink,
            config,
            maps: RwLock::new(Maps::default()),
            instance,
            next_seq: AtomicU64::new(1),
            diagnostics,
            metrics: RegistryMetrics::new(),
            _bus_guard: bus_guard,
        });
        let bus = EventBus::new(Arc::downgrade(&registry), rx, registry_dropped);
        (registry, bus)
    }

    /// Build a registry and spawn its bus on the current tokio runtime
    pub fn start(engine: Arc<dyn Engine>, config: RegistryConfig) -> Arc<Self> {
        let (registry, bus) = Self::new(engine, config);
        tokio::spawn(bus.run());
        registry
    }

    /// Allocate a new idle session
    pub async fn create(&self) -> SessionResult<Handle> {
        let mut maps = self.maps.write().await;
        if let Some(limit) = self.config.max_sessions {
            if maps.sessions.len() >= limit {
                warn!(limit, "Session limit reached");
                return Err(SessionError::Exhausted { limit });
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let handle = Handle(format!("{}-{}", self.instance, seq));
        maps.sessions.insert(
            handle.clone(),
            Arc::new(Mutex::new(Session::new(handle.clone()))),
        );
        self.metrics.session_created();

        debug!(handle = %handle, "Session created");
        Ok(handle)
    }

    pub async fn resolve(&self, handle: &Handle) -> SessionResult<SessionRef> {
        self.maps
            .read()
            .await
            .sessions
            .get(handle)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(handle.clone()))
    }

    /// Lock a session that is still registered
    async fn lock_live(&self, handle: &Handle) -> SessionResult<OwnedMutexGuard<Session>> {
        let session = self.resolve(handle).await?.lock_owned().await;
        if !session.state().is_live() {
            return Err(SessionError::NotFound(handle.clone()));
        }
        Ok(session)
    }

    pub async fn state(&self, handle: &Handle) -> SessionResult<SessionState> {
        Ok(self.lock_live(handle).await?.state())
    }

    pub async fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<_> = self.maps.read().await.sessions.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub async fn len(&self) -> usize {
        self.maps.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Connect a session and wait for the broker's acknowledgement
    ///
    /// Returns once the engine reports the outcome. Validation and TLS errors
    /// are returned before the engine is contacted.
    pub async fn connect(
        &self,
        handle: &Handle,
        address: &str,
        options: &ConnectionOptions,
    ) -> SessionResult<()> {
        let span = crate::session_span!(handle = %handle, op = "connect");
        let started = Instant::now();

        let outcome = match self
            .start_connect(handle, address, options)
            .instrument(span.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let _entered = span.enter();
                if e.is_caller_error() {
                    debug!(reason = e.reason(), error = %e, "Connect rejected");
                } else {
                    warn!(reason = e.reason(), error = %e, "Connect failed");
                }
                return Err(e);
            }
        };

        // Session lock is released; the bus settles the outcome
        let result = match outcome.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::new(
                "connect",
                "session closed before the connect settled",
            )),
        };

        let _entered = span.enter();
        match result {
            Ok(()) => {
                self.metrics.connect_succeeded(started.elapsed());
                info!("Connected");
                Ok(())
            }
            Err(e) => {
                self.metrics.connect_failed();
                let err = SessionError::Engine(e);
                warn!(reason = err.reason(), error = %err, "Connect failed");
                Err(err)
            }
        }
    }

    /// Everything `connect` does under the session lock
    async fn start_connect(
        &self,
        handle: &Handle,
        address: &str,
        options: &ConnectionOptions,
    ) -> SessionResult<oneshot::Receiver<Result<(), EngineError>>> {
        let mut session = self.lock_live(handle).await?;
        Lifecycle::check_connect(session.state())?;
        let config = normalize(handle, address, options)?;

        self.metrics.connect_attempt();
        if let Some(mut stale) = session.take_client() {
            self.forget_engine(stale.id()).await;
            stale.close().await;
        }

        let mut client = match self.engine.open_client(&config, self.sink.clone()) {
            Ok(client) => client,
            Err(e) => {
                self.metrics.connect_failed();
                return Err(e.into());
            }
        };
        let engine_id = client.id().clone();
        self.maps
            .write()
            .await
            .engine_ids
            .insert(engine_id.clone(), handle.clone());

        info!(
            broker = %config.broker_url(),
            client_id = %config.client_id,
            engine_id = %engine_id,
            "Connecting"
        );

        let (resolver, outcome) = oneshot::channel();
        session.begin_connect(config, engine_id.clone(), resolver);

        if let Err(e) = client.connect().await {
            warn!(error = %e, "Engine refused to start connecting");
            session.abort_connect();
            self.forget_engine(&engine_id).await;
            client.close().await;
            self.metrics.connect_failed();
            return Err(e.into());
        }
        session.attach_client(client);
        Ok(outcome)
    }

    pub async fn subscribe(&self, handle: &Handle, topic: &str, qos: QoS) -> SessionResult<()> {
        let session = self.lock_live(handle).await?;
        Lifecycle::check_operation(session.state())?;
        let client = session.client().ok_or(LifecycleError::NotConnected)?;

        client.subscribe(topic, qos).await?;
        debug!(handle = %handle, topic, qos = ?qos, "Subscribed");
        Ok(())
    }

    pub async fn unsubscribe(&self, handle: &Handle, topics: &[String]) -> SessionResult<()> {
        let session = self.lock_live(handle).await?;
        Lifecycle::check_operation(session.state())?;
        let client = session.client().ok_or(LifecycleError::NotConnected)?;

        client.unsubscribe(topics).await?;
        debug!(handle = %handle, topics = ?topics, "Unsubscribed");
        Ok(())
    }

    pub async fn publish(
        &self,
        handle: &Handle,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retained: bool,
    ) -> SessionResult<()> {
        let session = self.lock_live(handle).await?;
        Lifecycle::check_operation(session.state())?;
        let client = session.client().ok_or(LifecycleError::NotConnected)?;

        let payload = payload.into();
        let size = payload.len();
        match client.publish(topic, payload, qos, retained).await {
            Ok(()) => {
                self.metrics.published();
                debug!(handle = %handle, topic, size, qos = ?qos, retained, "Published");
                Ok(())
            }
            Err(e) => {
                self.metrics.publish_failed();
                Err(e.into())
            }
        }
    }

    /// Request a disconnect
    ///
    /// From `Connected` the engine is asked to disconnect and the session waits
    /// in `Disconnecting` for the acknowledgement. From `Connecting` the request
    /// is recorded and carried out once the connect attempt settles.
    pub async fn disconnect(&self, handle: &Handle) -> SessionResult<()> {
        let mut session = self.lock_live(handle).await?;
        Lifecycle::check_disconnect(session.state())?;

        if session.state() == SessionState::Connecting {
            debug!(handle = %handle, "Disconnect deferred until connect settles");
            session.request_disconnect();
            return Ok(());
        }

        session.set_state(SessionState::Disconnecting);
        let result = match session.client() {
            Some(client) => client.disconnect().await,
            None => Ok(()),
        };
        if let Err(e) = result {
            session.set_state(SessionState::Connected);
            warn!(handle = %handle, error = %e, "Engine rejected disconnect");
            return Err(e.into());
        }

        info!(handle = %handle, "Disconnecting");
        Ok(())
    }

    /// Destroy a session, releasing its engine client
    pub async fn close(&self, handle: &Handle) -> SessionResult<()> {
        let mut session = self.lock_live(handle).await?;
        Lifecycle::check_close(session.state())?;

        if let Some(mut client) = session.take_client() {
            self.forget_engine(client.id()).await;
            client.close().await;
        }
        session.mark_closed();
        self.maps.write().await.sessions.remove(handle);
        self.metrics.session_closed();

        info!(handle = %handle, "Session closed");
        Ok(())
    }

    /// Register a listener for one kind of event on a handle
    pub async fn on<F>(&self, handle: &Handle, kind: EventKind, listener: F) -> SessionResult<ListenerId>
    where
        F: Fn(&TaggedEvent) + Send + Sync + 'static,
    {
        self.add_listener(handle, kind, Arc::new(listener), false).await
    }

    /// Register a listener that is removed after its first delivery
    pub async fn once<F>(&self, handle: &Handle, kind: EventKind, listener: F) -> SessionResult<ListenerId>
    where
        F: Fn(&TaggedEvent) + Send + Sync + 'static,
    {
        self.add_listener(handle, kind, Arc::new(listener), true).await
    }

    /// Remove a listener; returns false if it was not registered
    pub async fn off(&self, handle: &Handle, kind: EventKind, id: ListenerId) -> SessionResult<bool> {
        let mut session = self.lock_live(handle).await?;
        Ok(session.listeners_mut().remove(kind, id))
    }

    async fn add_listener(
        &self,
        handle: &Handle,
        kind: EventKind,
        listener: Listener,
        once: bool,
    ) -> SessionResult<ListenerId> {
        let mut session = self.lock_live(handle).await?;
        let listeners = session.listeners_mut();
        let id = listeners.add(kind, listener, once);
        debug!(handle = %handle, kind = %kind, once, registered = listeners.len(kind), "Listener added");
        Ok(id)
    }

    /// Subscribe to process-level diagnostics (unroutable events, anomalies)
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.len().await)
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    pub(crate) fn publish_diagnostic(&self, diagnostic: Diagnostic) {
        // No subscribers is fine
        let _ = self.diagnostics.send(diagnostic);
    }

    pub(crate) async fn handle_for_engine(&self, id: &EngineId) -> Option<Handle> {
        self.maps.read().await.engine_ids.get(id).cloned()
    }

    pub(crate) async fn forget_engine(&self, id: &EngineId) {
        self.maps.write().await.engine_ids.remove(id);
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("instance", &self.instance)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    fn registry(max_sessions: Option<usize>) -> (Arc<Registry>, FakeEngine) {
        let engine = FakeEngine::new();
        let registry = Registry::start(Arc::new(engine.clone()), RegistryConfig { max_sessions });
        (registry, engine)
    }

    #[tokio::test]
    async fn test_handles_are_unique() {
        let (registry, _) = registry(None);

        let a = registry.create().await.unwrap();
        let b = registry.create().await.unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.state(&a).await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_handles_unique_across_registries() {
        let (first, _) = registry(None);
        let (second, _) = registry(None);

        assert_ne!(first.create().await.unwrap(), second.create().await.unwrap());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let (registry, _) = registry(Some(1));

        registry.create().await.unwrap();
        assert!(matches!(
            registry.create().await,
            Err(SessionError::Exhausted { limit: 1 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let (registry, _) = registry(None);
        let ghost = Handle::from("ghost-1");

        assert!(matches!(
            registry.state(&ghost).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.publish(&ghost, "t", "x", QoS::AtMostOnce, false).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let (registry, engine) = registry(None);
        let handle = registry.create().await.unwrap();

        assert!(matches!(
            registry.subscribe(&handle, "t", QoS::AtLeastOnce).await,
            Err(SessionError::Lifecycle(LifecycleError::NotConnected))
        ));
        assert!(matches!(
            registry.disconnect(&handle).await,
            Err(SessionError::Lifecycle(LifecycleError::NotConnected))
        ));
        assert_eq!(engine.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_connect_validation_error_leaves_session_idle() {
        let (registry, engine) = registry(None);
        let handle = registry.create().await.unwrap();

        let options = ConnectionOptions {
            timeout: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            registry.connect(&handle, "mqtt://localhost", &options).await,
            Err(SessionError::Validation(_))
        ));
        assert_eq!(registry.state(&handle).await.unwrap(), SessionState::Idle);
        assert_eq!(engine.calls().opened, 0);
    }

    #[tokio::test]
    async fn test_close_idle_session() {
        let (registry, _) = registry(None);
        let handle = registry.create().await.unwrap();

        registry.close(&handle).await.unwrap();

        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.resolve(&handle).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.close(&handle).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_metrics_track_sessions() {
        let (registry, _) = registry(None);
        let handle = registry.create().await.unwrap();
        registry.create().await.unwrap();
        registry.close(&handle).await.unwrap();

        let snapshot = registry.metrics_snapshot().await;
        assert_eq!(snapshot.sessions.created, 2);
        assert_eq!(snapshot.sessions.closed, 1);
        assert_eq!(snapshot.sessions.live, 1);
    }
}
