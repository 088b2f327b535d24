//! mqttplex - multi-session MQTT client registry
//!
//! Callers create sessions and address them by opaque [`Handle`]s. Each session
//! carries its own broker connection, lifecycle state and event listeners.
//!
//! # Overview
//!
//! - [`connection`] normalizes an address plus a loosely-typed option bag into a
//!   validated [`ConnectionConfig`]
//! - [`tls`] turns PEM or PKCS#12 credential inputs into TLS material
//! - [`lifecycle`] guards operations and decides state transitions
//! - [`bus`] correlates engine events back to the owning session and fans them
//!   out to listeners
//! - [`engine`] is the seam to the MQTT implementation; [`engine::rumqttc`] is
//!   the production engine and [`testing::FakeEngine`] an in-memory one
//!
//! # Quick Start
//!
//! ```rust
//! use mqttplex::testing::FakeEngine;
//! use mqttplex::{ConnectionOptions, EventKind, QoS, Registry, RegistryConfig, SessionState};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), mqttplex::SessionError> {
//! let registry = Registry::start(Arc::new(FakeEngine::new()), RegistryConfig::default());
//!
//! let handle = registry.create().await?;
//! registry
//!     .on(&handle, EventKind::Message, |event| {
//!         println!("{} got {:?}", event.handle, event.event);
//!     })
//!     .await?;
//!
//! registry
//!     .connect(&handle, "mqtt://localhost:1883", &ConnectionOptions::default())
//!     .await?;
//! assert_eq!(registry.state(&handle).await?, SessionState::Connected);
//!
//! registry.subscribe(&handle, "sensors/#", QoS::AtLeastOnce).await?;
//! registry
//!     .publish(&handle, "sensors/t1", "21.5", QoS::AtMostOnce, false)
//!     .await?;
//!
//! registry.close(&handle).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod session;
pub mod testing;
pub mod tls;

pub use bus::{Diagnostic, Event, EventBus, EventKind, ListenerId, TaggedEvent};
pub use config::{AppConfig, ConfigError, ConnectionOptions, RegistryConfig, TlsOptions};
pub use connection::{normalize, ConnectionConfig, Credentials, Scheme, ValidationError};
pub use engine::{Engine, EngineClient, EngineError, EngineId, QoS};
pub use error::{SessionError, SessionResult};
pub use lifecycle::{LifecycleError, SessionState};
pub use registry::{Handle, Registry};
pub use tls::{build_tls_material, TlsBuildError, TlsMaterial};
