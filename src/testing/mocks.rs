//! Scriptable in-memory engine
//!
//! [`FakeEngine`] records every call the registry makes and lets tests decide how
//! the "broker" answers: acknowledge connects immediately, refuse them, stay
//! silent, or reject the request outright. Tests can also inject arbitrary
//! engine events for any client, addressed by MQTT client id.

use crate::bus::Event;
use crate::connection::ConnectionConfig;
use crate::engine::{Engine, EngineClient, EngineError, EngineId, EventSink, QoS};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// How the fake broker answers a connect
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Emit `Connected` as soon as `connect` is called
    #[default]
    Accept,
    /// Emit a connect `Error` with the given detail
    Refuse(String),
    /// Emit nothing; the test drives the outcome
    Silent,
    /// Fail the `connect` call itself
    Reject(String),
}

/// Message handed to the engine by `publish`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Every call the registry made into the engine
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub opened: usize,
    pub connects: usize,
    pub subscriptions: Vec<(String, QoS)>,
    pub unsubscriptions: Vec<Vec<String>>,
    pub published: Vec<PublishedMessage>,
    pub disconnects: usize,
    pub closes: usize,
}

impl CallLog {
    pub fn total(&self) -> usize {
        self.opened
            + self.connects
            + self.subscriptions.len()
            + self.unsubscriptions.len()
            + self.published.len()
            + self.disconnects
            + self.closes
    }
}

#[derive(Default)]
struct FakeState {
    connect_behavior: ConnectBehavior,
    ack_disconnect: bool,
    operation_failure: Option<String>,
    calls: CallLog,
    configs: Vec<ConnectionConfig>,
    /// Latest engine id per MQTT client id
    clients: HashMap<String, EngineId>,
    sink: Option<EventSink>,
    publish_gate: Option<Arc<Notify>>,
    held_publishes: usize,
}

/// In-memory [`Engine`] for tests
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_behavior(ConnectBehavior::Accept)
    }

    pub fn with_behavior(behavior: ConnectBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                connect_behavior: behavior,
                ack_disconnect: true,
                ..Default::default()
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        // A panicking test thread must not hide the log from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().connect_behavior = behavior;
    }

    /// Whether `disconnect` is acknowledged with a `Disconnected` event
    pub fn set_ack_disconnect(&self, ack: bool) {
        self.lock().ack_disconnect = ack;
    }

    /// Make subscribe, unsubscribe and publish fail with the given detail
    pub fn fail_operations(&self, detail: Option<&str>) {
        self.lock().operation_failure = detail.map(str::to_string);
    }

    /// Park every later `publish` until the returned gate is notified
    ///
    /// Each `notify_one` releases one parked publish.
    pub fn hold_publishes(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().publish_gate = Some(gate.clone());
        gate
    }

    /// Number of publishes currently parked on the gate
    pub fn held_publishes(&self) -> usize {
        self.lock().held_publishes
    }

    pub fn calls(&self) -> CallLog {
        self.lock().calls.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().calls.published.clone()
    }

    /// Configuration of the most recently opened client
    pub fn last_config(&self) -> Option<ConnectionConfig> {
        self.lock().configs.last().cloned()
    }

    /// Engine id of the latest client opened with this MQTT client id
    pub fn engine_id_for(&self, client_id: &str) -> Option<EngineId> {
        self.lock().clients.get(client_id).cloned()
    }

    /// Inject an event for the latest client opened with this MQTT client id
    ///
    /// Client ids default to the session handle string. Returns false if no such
    /// client was ever opened.
    pub fn emit_for(&self, client_id: &str, event: Event) -> bool {
        let state = self.lock();
        match (state.clients.get(client_id), &state.sink) {
            (Some(id), Some(sink)) => sink.emit(id, event),
            _ => false,
        }
    }

    /// Inject an event under an arbitrary engine identity
    pub fn emit_as(&self, id: &EngineId, event: Event) -> bool {
        match &self.lock().sink {
            Some(sink) => sink.emit(id, event),
            None => false,
        }
    }
}

impl Engine for FakeEngine {
    fn open_client(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Box<dyn EngineClient>, EngineError> {
        let id = EngineId::new(format!("fake-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));

        let mut state = self.lock();
        state.calls.opened += 1;
        state.configs.push(config.clone());
        state.clients.insert(config.client_id.clone(), id.clone());
        state.sink = Some(events.clone());

        Ok(Box::new(FakeClient {
            id,
            engine: self.clone(),
            events,
        }))
    }
}

struct FakeClient {
    id: EngineId,
    engine: FakeEngine,
    events: EventSink,
}

impl FakeClient {
    fn operation_result(&self, context: &str) -> Result<(), EngineError> {
        match &self.engine.lock().operation_failure {
            Some(detail) => Err(EngineError::new(context, detail.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EngineClient for FakeClient {
    fn id(&self) -> &EngineId {
        &self.id
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        let behavior = {
            let mut state = self.engine.lock();
            state.calls.connects += 1;
            state.connect_behavior.clone()
        };

        match behavior {
            ConnectBehavior::Accept => {
                self.events.emit(&self.id, Event::Connected { reconnect: false });
            }
            ConnectBehavior::Refuse(detail) => {
                self.events.emit(
                    &self.id,
                    Event::Error {
                        context: "connect".to_string(),
                        detail,
                    },
                );
            }
            ConnectBehavior::Silent => {}
            ConnectBehavior::Reject(detail) => return Err(EngineError::new("connect", detail)),
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        self.operation_result("subscribe")?;
        self.engine
            .lock()
            .calls
            .subscriptions
            .push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        self.operation_result("unsubscribe")?;
        self.engine.lock().calls.unsubscriptions.push(topics.to_vec());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), EngineError> {
        self.operation_result("publish")?;
        let gate = self.engine.lock().publish_gate.clone();
        if let Some(gate) = gate {
            self.engine.lock().held_publishes += 1;
            gate.notified().await;
            self.engine.lock().held_publishes -= 1;
        }
        self.engine.lock().calls.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retained,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        let ack = {
            let mut state = self.engine.lock();
            state.calls.disconnects += 1;
            state.ack_disconnect
        };
        if ack {
            self.events.emit(&self.id, Event::Disconnected { cause: None });
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.engine.lock().calls.closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use crate::connection::normalize;
    use crate::registry::Handle;

    fn open(engine: &FakeEngine) -> (Box<dyn EngineClient>, tokio::sync::mpsc::UnboundedReceiver<crate::engine::EngineEnvelope>) {
        let config = normalize(&Handle::from("h-1"), "mqtt://localhost", &ConnectionOptions::default()).unwrap();
        let (sink, rx) = EventSink::channel();
        (engine.open_client(&config, sink).unwrap(), rx)
    }

    #[tokio::test]
    async fn test_accepting_engine_emits_connected() {
        let engine = FakeEngine::new();
        let (mut client, mut rx) = open(&engine);

        client.connect().await.unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(&envelope.id, client.id());
        assert_eq!(envelope.event, Event::Connected { reconnect: false });
        assert_eq!(engine.engine_id_for("h-1").as_ref(), Some(client.id()));
    }

    #[tokio::test]
    async fn test_rejecting_engine_fails_connect() {
        let engine = FakeEngine::with_behavior(ConnectBehavior::Reject("no route".to_string()));
        let (mut client, _rx) = open(&engine);

        assert_eq!(
            client.connect().await,
            Err(EngineError::new("connect", "no route"))
        );
    }

    #[tokio::test]
    async fn test_publish_gate_parks_until_notified() {
        let engine = FakeEngine::new();
        let (client, _rx) = open(&engine);
        let gate = engine.hold_publishes();

        let publish = tokio::spawn(async move {
            client
                .publish("a/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
                .await
        });
        while engine.held_publishes() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(engine.published().is_empty());

        gate.notify_one();
        publish.await.unwrap().unwrap();
        assert_eq!(engine.published().len(), 1);
        assert_eq!(engine.held_publishes(), 0);
    }

    #[tokio::test]
    async fn test_call_log_and_operation_failures() {
        let engine = FakeEngine::new();
        let (client, _rx) = open(&engine);

        client
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, true)
            .await
            .unwrap();
        engine.fail_operations(Some("queue full"));
        assert!(client.subscribe("a/#", QoS::AtMostOnce).await.is_err());

        let calls = engine.calls();
        assert_eq!(calls.opened, 1);
        assert_eq!(calls.published.len(), 1);
        assert!(calls.subscriptions.is_empty());
        assert_eq!(calls.total(), 2);
    }
}
