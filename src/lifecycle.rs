//! Session lifecycle state machine
//!
//! ```text
//! Idle -> Connecting -> Connected -> Disconnecting -> Disconnected -> Closed
//!                          ^                               |
//!                          +------- engine reconnect ------+
//! ```
//!
//! Caller operations are checked against the guards in [`Lifecycle`] before any
//! engine call is made. Engine events are folded into the state by
//! [`Lifecycle::on_engine_event`], a pure function that returns a [`Transition`]
//! describing what the event bus must do: the next state, the event to deliver
//! (if any), how to settle a pending connect, and any engine follow-up.

use crate::bus::Event;
use crate::engine::EngineError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Closed,
}

impl SessionState {
    /// False once the session has been closed
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Operation attempted in a state that does not allow it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("session is already connecting")]
    AlreadyConnecting,

    #[error("session must be disconnected first")]
    NotDisconnected,

    #[error("cannot {op} while {state}")]
    InvalidTransition {
        op: &'static str,
        state: SessionState,
    },
}

/// Engine-side work the bus must issue after applying a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    /// A disconnect requested while connecting is now due
    Disconnect,
}

/// Engine behaviour that is tolerated but worth flagging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// `Connected` reported for a session that is already connected
    DuplicateConnected,
    /// Engine reconnected a session whose auto-reconnect is disabled
    UnexpectedReconnect,
}

/// Lifecycle facts the transition function needs about a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleContext {
    pub state: SessionState,
    /// State the session was in when the current connect started
    pub origin: SessionState,
    pub auto_reconnect: bool,
    /// Caller asked to disconnect while the connect was pending
    pub disconnect_requested: bool,
}

/// Outcome of folding one engine event into a session
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    /// Event to hand to listeners; `None` drops it
    pub emit: Option<Event>,
    /// Result for the pending connect continuation
    pub resolve: Option<Result<(), EngineError>>,
    pub follow_up: Option<FollowUp>,
    /// Drop the connection config and retire the engine client
    pub clear_config: bool,
    pub anomaly: Option<Anomaly>,
}

impl Transition {
    fn stay(state: SessionState, emit: Option<Event>) -> Self {
        Self {
            next: state,
            emit,
            resolve: None,
            follow_up: None,
            clear_config: false,
            anomaly: None,
        }
    }

    fn to(next: SessionState, event: Event) -> Self {
        Self::stay(next, Some(event))
    }

    fn drop_event(state: SessionState) -> Self {
        Self::stay(state, None)
    }

    /// True when nothing changes and nothing is delivered
    pub fn is_noop(&self, current: SessionState) -> bool {
        self.next == current
            && self.emit.is_none()
            && self.resolve.is_none()
            && self.follow_up.is_none()
            && !self.clear_config
    }
}

/// Guards and transition rules for session state
pub struct Lifecycle;

impl Lifecycle {
    pub fn check_connect(state: SessionState) -> Result<(), LifecycleError> {
        match state {
            SessionState::Idle | SessionState::Disconnected => Ok(()),
            SessionState::Connecting => Err(LifecycleError::AlreadyConnecting),
            SessionState::Connected => Err(LifecycleError::AlreadyConnected),
            state => Err(LifecycleError::InvalidTransition {
                op: "connect",
                state,
            }),
        }
    }

    /// Guard for subscribe, unsubscribe and publish
    pub fn check_operation(state: SessionState) -> Result<(), LifecycleError> {
        match state {
            SessionState::Connected => Ok(()),
            _ => Err(LifecycleError::NotConnected),
        }
    }

    pub fn check_disconnect(state: SessionState) -> Result<(), LifecycleError> {
        match state {
            SessionState::Connected | SessionState::Connecting => Ok(()),
            _ => Err(LifecycleError::NotConnected),
        }
    }

    pub fn check_close(state: SessionState) -> Result<(), LifecycleError> {
        match state {
            SessionState::Idle | SessionState::Disconnected => Ok(()),
            _ => Err(LifecycleError::NotDisconnected),
        }
    }

    /// Fold one engine event into the session state
    pub fn on_engine_event(ctx: &LifecycleContext, event: &Event) -> Transition {
        use SessionState::*;

        match (ctx.state, event) {
            (Idle | Closed, _) => Transition::drop_event(ctx.state),

            (_, Event::MessageReceived { .. }) => Transition::to(ctx.state, event.clone()),

            (Connecting, Event::Connected { .. }) => {
                let connected = Event::Connected { reconnect: false };
                if ctx.disconnect_requested {
                    Transition {
                        follow_up: Some(FollowUp::Disconnect),
                        resolve: Some(Ok(())),
                        ..Transition::to(Disconnecting, connected)
                    }
                } else {
                    Transition {
                        resolve: Some(Ok(())),
                        ..Transition::to(Connected, connected)
                    }
                }
            }

            (Connecting, Event::Error { context, detail }) => Transition {
                resolve: Some(Err(EngineError::new(context.clone(), detail.clone()))),
                clear_config: true,
                ..Transition::to(Self::failed_connect_state(ctx), event.clone())
            },

            (Connecting, Event::Disconnected { cause }) => Transition {
                resolve: Some(Err(EngineError::new(
                    "connect",
                    cause
                        .clone()
                        .unwrap_or_else(|| "connection closed before acknowledgement".to_string()),
                ))),
                clear_config: true,
                ..Transition::drop_event(Self::failed_connect_state(ctx))
            },

            (Connected, Event::Connected { .. }) => Transition {
                anomaly: Some(Anomaly::DuplicateConnected),
                ..Transition::to(Connected, event.clone())
            },

            (Connected | Disconnecting, Event::Disconnected { .. }) => {
                Transition::to(Disconnected, event.clone())
            }

            (Disconnected, Event::Connected { .. }) => Transition {
                anomaly: (!ctx.auto_reconnect).then_some(Anomaly::UnexpectedReconnect),
                ..Transition::to(Connected, Event::Connected { reconnect: true })
            },

            (_, Event::Error { .. }) => Transition::to(ctx.state, event.clone()),

            (Disconnecting, Event::Connected { .. })
            | (Disconnected, Event::Disconnected { .. }) => Transition::drop_event(ctx.state),
        }
    }

    fn failed_connect_state(ctx: &LifecycleContext) -> SessionState {
        if ctx.disconnect_requested {
            SessionState::Disconnected
        } else {
            ctx.origin
        }
    }
}
