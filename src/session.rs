//! Per-handle session object
//!
//! A [`Session`] is owned by the registry behind an async mutex. It holds the
//! lifecycle state, the resolved configuration of the current connection, the
//! engine client, the listener table, and the continuation of a pending connect.
//! All mutation goes through the registry (caller operations) or the event bus
//! (engine events) while the mutex is held.

use crate::bus::{Event, ListenerTable};
use crate::connection::ConnectionConfig;
use crate::engine::{EngineClient, EngineError, EngineId};
use crate::lifecycle::{FollowUp, LifecycleContext, SessionState, Transition};
use crate::registry::Handle;
use std::fmt;
use tokio::sync::oneshot;
use tracing::warn;

/// Sender half of a pending connect
pub type ConnectResolver = oneshot::Sender<Result<(), EngineError>>;

pub struct Session {
    handle: Handle,
    state: SessionState,
    config: Option<ConnectionConfig>,
    engine_id: Option<EngineId>,
    client: Option<Box<dyn EngineClient>>,
    listeners: ListenerTable,
    pending_connect: Option<ConnectResolver>,
    /// State before the current connect started
    origin: SessionState,
    disconnect_requested: bool,
}

/// Side effects of a transition that the bus still has to carry out
pub struct Applied {
    pub next: SessionState,
    pub emit: Option<Event>,
    pub follow_up: Option<FollowUp>,
    /// Client to close after a failed connect
    pub retired_client: Option<Box<dyn EngineClient>>,
}

impl Session {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: SessionState::Idle,
            config: None,
            engine_id: None,
            client: None,
            listeners: ListenerTable::default(),
            pending_connect: None,
            origin: SessionState::Idle,
            disconnect_requested: false,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration of the current or last successful connection
    pub fn config(&self) -> Option<&ConnectionConfig> {
        self.config.as_ref()
    }

    pub fn engine_id(&self) -> Option<&EngineId> {
        self.engine_id.as_ref()
    }

    pub fn client(&self) -> Option<&dyn EngineClient> {
        self.client.as_deref()
    }

    pub fn listeners_mut(&mut self) -> &mut ListenerTable {
        &mut self.listeners
    }

    pub fn is_connect_pending(&self) -> bool {
        self.pending_connect.is_some()
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn lifecycle_context(&self) -> LifecycleContext {
        LifecycleContext {
            state: self.state,
            origin: self.origin,
            auto_reconnect: self
                .config
                .as_ref()
                .map(|c| c.auto_reconnect)
                .unwrap_or(false),
            disconnect_requested: self.disconnect_requested,
        }
    }

    /// Enter `Connecting` with a freshly opened engine client
    ///
    /// The client is attached only after its `connect` call succeeds; see
    /// [`Session::attach_client`].
    pub(crate) fn begin_connect(
        &mut self,
        config: ConnectionConfig,
        engine_id: EngineId,
        resolver: ConnectResolver,
    ) {
        self.origin = self.state;
        self.state = SessionState::Connecting;
        self.config = Some(config);
        self.engine_id = Some(engine_id);
        self.pending_connect = Some(resolver);
        self.disconnect_requested = false;
    }

    pub(crate) fn attach_client(&mut self, client: Box<dyn EngineClient>) {
        self.client = Some(client);
    }

    /// Undo `begin_connect` after the engine refused to start connecting
    pub(crate) fn abort_connect(&mut self) {
        self.state = self.origin;
        self.config = None;
        self.engine_id = None;
        self.pending_connect = None;
        self.disconnect_requested = false;
    }

    pub(crate) fn request_disconnect(&mut self) {
        self.disconnect_requested = true;
    }

    pub(crate) fn take_client(&mut self) -> Option<Box<dyn EngineClient>> {
        self.engine_id = None;
        self.client.take()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
        self.config = None;
        self.pending_connect = None;
    }

    /// Apply a lifecycle transition produced for this session
    pub(crate) fn apply(&mut self, transition: Transition) -> Applied {
        self.state = transition.next;

        if let Some(result) = transition.resolve {
            match self.pending_connect.take() {
                // The caller may have stopped waiting; that is not an error
                Some(resolver) => {
                    let _ = resolver.send(result);
                }
                None => warn!(
                    handle = %self.handle,
                    "Connect outcome arrived with no pending connect"
                ),
            }
            self.disconnect_requested = false;
        }

        let retired_client = if transition.clear_config {
            self.config = None;
            self.take_client()
        } else {
            None
        };

        Applied {
            next: self.state,
            emit: transition.emit,
            follow_up: transition.follow_up,
            retired_client,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("engine_id", &self.engine_id)
            .field("has_config", &self.config.is_some())
            .field("connect_pending", &self.pending_connect.is_some())
            .field("listeners", &self.listeners)
            .finish()
    }
}
