//! Boundary to the MQTT protocol engine
//!
//! The registry never speaks MQTT itself. It hands a canonical
//! [`ConnectionConfig`] to an [`Engine`], receives an [`EngineClient`] back, and
//! listens for events the engine emits through an [`EventSink`]. Events are tagged
//! with the engine's own [`EngineId`]; the event bus maps that identity back to a
//! caller-facing handle.
//!
//! Two implementations ship with the crate:
//!
//! - [`rumqttc::RumqttcEngine`] - production engine backed by the `rumqttc` crate
//! - [`crate::testing::FakeEngine`] - scriptable in-memory engine for tests

pub mod rumqttc;

use crate::bus::Event;
use crate::connection::{ConnectionConfig, ValidationError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Identity the engine uses for one of its clients
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ValidationError::new(
                "qos",
                format!("QoS must be 0, 1 or 2, got {other}"),
            )),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

/// Failure reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{context}: {detail}")]
pub struct EngineError {
    /// Operation the engine was performing (`connect`, `publish`, ...)
    pub context: String,
    /// Engine-supplied description of the failure
    pub detail: String,
}

impl EngineError {
    pub fn new(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

/// Raw engine event together with the identity of the client that produced it
#[derive(Debug, Clone)]
pub struct EngineEnvelope {
    pub id: EngineId,
    pub event: Event,
}

/// Single asynchronous channel every engine client reports into
///
/// Cloned into each engine client. Emission never blocks, so engines may call it
/// from any thread or task, including from inside synchronous callbacks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEnvelope>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit an event for the given engine client
    ///
    /// Returns false when the bus has shut down and the event was discarded.
    pub fn emit(&self, id: &EngineId, event: Event) -> bool {
        let delivered = self
            .tx
            .send(EngineEnvelope {
                id: id.clone(),
                event,
            })
            .is_ok();
        if !delivered {
            debug!(engine_id = %id, "Event bus closed, dropping engine event");
        }
        delivered
    }
}

/// Factory for engine clients
pub trait Engine: Send + Sync {
    /// Create a client for the given configuration without contacting the broker
    ///
    /// The engine chooses the client's identity. Events for the client must not
    /// be emitted before [`EngineClient::connect`] is called.
    fn open_client(
        &self,
        config: &ConnectionConfig,
        events: EventSink,
    ) -> Result<Box<dyn EngineClient>, EngineError>;
}

/// One engine-side MQTT client
///
/// Request methods return once the engine has accepted the request. Outcomes
/// that arrive later (ConnAck, SubAck failures, connection loss) are reported
/// through the [`EventSink`] the client was opened with.
#[async_trait]
pub trait EngineClient: Send + Sync {
    fn id(&self) -> &EngineId;

    /// Start connecting; the outcome arrives as a `Connected` or `Error` event
    async fn connect(&mut self) -> Result<(), EngineError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), EngineError>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), EngineError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    ) -> Result<(), EngineError>;

    /// Request a disconnect; acknowledged with a `Disconnected` event
    async fn disconnect(&self) -> Result<(), EngineError>;

    /// Release every resource held by the client. No events follow.
    async fn close(&mut self);
}
