//! rumqttc-backed [`Engine`]
//!
//! Each client owns one rumqttc `AsyncClient` and a supervisor task that drives
//! the event loop. The supervisor translates event-loop traffic into bus
//! [`Event`]s, enforces the connect timeout, and paces rumqttc's automatic
//! re-dial with a [`ReconnectConfig`] backoff when auto-reconnect is enabled.

pub mod options;
pub mod reconnect;
pub mod routing;

use crate::bus::Event;
use crate::connection::ConnectionConfig;
use crate::engine::{Engine, EngineClient, EngineError, EngineId, EventSink, QoS};
use crate::engine_span;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, MqttOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

pub use options::{mqtt_options, rustls_client_config};
pub use reconnect::{ReconnectConfig, ReconnectionDecision};
pub use routing::{route_event, EventRoute};

/// Capacity of the request channel between `AsyncClient` and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Engine that opens real broker connections through rumqttc
#[derive(Debug, Default)]
pub struct RumqttcEngine {
    next_id: AtomicU64,
    reconnect: ReconnectConfig,
}

impl RumqttcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reconnect_config(reconnect: ReconnectConfig) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            reconnect,
        }
    }
}

impl Engine for RumqttcEngine {
    fn open_client(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Box<dyn EngineClient>, EngineError> {
        let options = mqtt_options(config)?;
        let id = EngineId::new(format!(
            "rumqttc-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed) + 1
        ));

        debug!(engine_id = %id, client_id = %config.client_id, "Opened rumqttc client");

        Ok(Box::new(RumqttcClient {
            id,
            options: Some(options),
            client: None,
            supervisor: None,
            shutdown_tx: None,
            events,
            connect_timeout: config.connect_timeout,
            auto_reconnect: config.auto_reconnect,
            reconnect: self.reconnect.clone(),
        }))
    }
}

pub struct RumqttcClient {
    id: EngineId,
    /// Consumed by the first `connect`
    options: Option<MqttOptions>,
    client: Option<AsyncClient>,
    supervisor: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    events: EventSink,
    connect_timeout: Duration,
    auto_reconnect: bool,
    reconnect: ReconnectConfig,
}

impl RumqttcClient {
    fn client(&self, context: &str) -> Result<&AsyncClient, EngineError> {
        self.client
            .as_ref()
            .ok_or_else(|| EngineError::new(context, "client is not connected"))
    }
}

#[async_trait]
impl EngineClient for RumqttcClient {
    fn id(&self) -> &EngineId {
        &self.id
    }

    async fn connect(&mut self) -> Result<(), EngineError> {
        let options = self
            .options
            .take()
            .ok_or_else(|| EngineError::new("connect", "client already started"))?;

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            id: self.id.clone(),
            events: self.events.clone(),
            connect_timeout: self.connect_timeout,
            auto_reconnect: self.auto_reconnect,
            reconnect: self.reconnect.clone(),
            shutdown_rx,
            acknowledged: false,
            attempts: 0,
        };
        let span = engine_span!(engine_id = %self.id);
        self.supervisor = Some(tokio::spawn(supervisor.run(event_loop).instrument(span)));
        self.shutdown_tx = Some(shutdown_tx);
        self.client = Some(client);

        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError> {
        self.client("subscribe")?
            .subscribe(topic, options::to_rumqttc_qos(qos))
            .await
            .map_err(|e| EngineError::new("subscribe", e.to_string()))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError> {
        let client = self.client("unsubscribe")?;
        for topic in topics {
            client
                .unsubscribe(topic.as_str())
                .await
                .map_err(|e| EngineError::new("unsubscribe", e.to_string()))?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), EngineError> {
        self.client("publish")?
            .publish_bytes(topic, options::to_rumqttc_qos(qos), retained, payload)
            .await
            .map_err(|e| EngineError::new("publish", e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), EngineError> {
        self.client("disconnect")?
            .disconnect()
            .await
            .map_err(|e| EngineError::new("disconnect", e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        self.client = None;
        debug!(engine_id = %self.id, "Closed rumqttc client");
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

/// Drives one event loop until shutdown, a terminal error, or a clean disconnect
struct Supervisor {
    id: EngineId,
    events: EventSink,
    connect_timeout: Duration,
    auto_reconnect: bool,
    reconnect: ReconnectConfig,
    shutdown_rx: watch::Receiver<bool>,
    /// Set once the first CONNACK has been accepted
    acknowledged: bool,
    /// Consecutive reconnect attempts since the last accepted CONNACK
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        let deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("Supervisor shutdown requested");
                        break;
                    }
                }
                _ = &mut deadline, if !self.acknowledged => {
                    warn!(timeout = ?self.connect_timeout, "Timed out waiting for CONNACK");
                    self.emit(Event::Error {
                        context: "connect".to_string(),
                        detail: format!(
                            "no CONNACK within {}s",
                            self.connect_timeout.as_secs()
                        ),
                    });
                    break;
                }
                polled = event_loop.poll() => {
                    let keep_running = match polled {
                        Ok(event) => self.on_route(route_event(&event)),
                        Err(e) => self.on_connection_error(e.to_string()).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        debug!("Supervisor stopped");
    }

    fn emit(&self, event: Event) {
        if !self.events.emit(&self.id, event) {
            debug!("Event sink closed; dropping engine event");
        }
    }

    /// Returns false when the supervisor should stop
    fn on_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged {
                accepted: true,
                session_present,
                ..
            } => {
                let reconnect = self.acknowledged;
                self.acknowledged = true;
                self.attempts = 0;
                info!(reconnect, session_present, "Connected to broker");
                self.emit(Event::Connected { reconnect });
                true
            }
            EventRoute::ConnectionAcknowledged { code, .. } => {
                error!(code = %code, "Broker refused connection");
                self.emit(Event::Error {
                    context: "connect".to_string(),
                    detail: format!("connection refused: {code}"),
                });
                self.acknowledged
            }
            EventRoute::MessageReceived { topic, payload } => {
                debug!(topic = %topic, bytes = payload.len(), "Message received");
                self.emit(Event::MessageReceived { topic, payload });
                true
            }
            EventRoute::SubscriptionRejected { pkid } => {
                warn!(pkid, "Broker rejected subscription");
                self.emit(Event::Error {
                    context: "subscribe".to_string(),
                    detail: format!("subscription rejected (packet id {pkid})"),
                });
                true
            }
            EventRoute::BrokerDisconnect => {
                // The following poll error reports the loss
                debug!("Broker sent DISCONNECT");
                true
            }
            EventRoute::DisconnectSent => {
                info!("Disconnected from broker");
                self.emit(Event::Disconnected { cause: None });
                false
            }
            EventRoute::Infrastructure => true,
        }
    }

    /// Returns false when the supervisor should stop
    async fn on_connection_error(&mut self, detail: String) -> bool {
        if !self.acknowledged {
            error!(error = %detail, "Connection attempt failed");
            self.emit(Event::Error {
                context: "connect".to_string(),
                detail,
            });
            return false;
        }

        if self.attempts == 0 {
            warn!(error = %detail, "Connection lost");
            self.emit(Event::Disconnected {
                cause: Some(detail),
            });
        } else {
            debug!(error = %detail, attempt = self.attempts, "Reconnect attempt failed");
        }

        if !self.auto_reconnect {
            return false;
        }

        let shutdown_requested = *self.shutdown_rx.borrow();
        match self.reconnect.decide(self.attempts, shutdown_requested) {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.attempts = attempt;
                info!(attempt, delay_ms, "Scheduling reconnect");
                self.interruptible_sleep(delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                error!(attempts = self.attempts, "Giving up on reconnection");
                self.emit(Event::Error {
                    context: "reconnect".to_string(),
                    detail: format!("gave up after {} attempts", self.attempts),
                });
                false
            }
        }
    }

    /// Sleep for `delay_ms`; returns false if shutdown arrived first
    async fn interruptible_sleep(&mut self, delay_ms: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
        }
    }
}
