//! Event correlation bus
//!
//! Every engine client reports into one asynchronous channel. The [`EventBus`]
//! drains it in arrival order, maps each engine identity back to its handle and
//! queues the event on that handle's worker. The worker folds the event into the
//! session's lifecycle and delivers it to the listeners registered for that
//! handle only. Order is preserved per handle, not across handles.
//!
//! Listeners are invoked after the session lock is released, from a snapshot
//! taken under the lock. Registering or removing a listener from inside a
//! listener is therefore safe and never disturbs the dispatch in progress.

use crate::engine::{EngineEnvelope, EngineId};
use crate::error::sanitize_error_message;
use crate::lifecycle::{Anomaly, FollowUp, Lifecycle, SessionState};
use crate::registry::{Handle, Registry};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn, Instrument};

/// Asynchronous session event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected { reconnect: bool },
    Disconnected { cause: Option<String> },
    MessageReceived { topic: String, payload: Bytes },
    Error { context: String, detail: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected { .. } => EventKind::Connect,
            Event::Disconnected { .. } => EventKind::Disconnect,
            Event::MessageReceived { .. } => EventKind::Message,
            Event::Error { .. } => EventKind::Error,
        }
    }

    /// Redact secrets from engine-supplied text
    fn sanitized(self) -> Self {
        match self {
            Event::Error { context, detail } => Event::Error {
                context,
                detail: sanitize_error_message(&detail),
            },
            Event::Disconnected { cause } => Event::Disconnected {
                cause: cause.map(|c| sanitize_error_message(&c)),
            },
            other => other,
        }
    }
}

/// Listener category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Message => "message",
            EventKind::Error => "error",
        };
        f.write_str(name)
    }
}

/// Event as seen by listeners, tagged with the handle it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub handle: Handle,
    pub event: Event,
}

/// Event callback registered on a handle
pub type Listener = Arc<dyn Fn(&TaggedEvent) + Send + Sync>;

/// Registration token returned by `on`/`once`, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    callback: Listener,
    once: bool,
}

/// Per-session listener registrations, kept in registration order
#[derive(Default)]
pub struct ListenerTable {
    entries: HashMap<EventKind, Vec<ListenerEntry>>,
    next_id: u64,
}

impl ListenerTable {
    pub fn add(&mut self, kind: EventKind, callback: Listener, once: bool) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.entry(kind).or_default().push(ListenerEntry { id, callback, once });
        id
    }

    /// Returns false when no such registration exists
    pub fn remove(&mut self, kind: EventKind, id: ListenerId) -> bool {
        let Some(entries) = self.entries.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Listeners to invoke for one event; one-shot entries are consumed
    pub fn snapshot(&mut self, kind: EventKind) -> Vec<Listener> {
        let Some(entries) = self.entries.get_mut(&kind) else {
            return Vec::new();
        };
        let snapshot = entries.iter().map(|entry| entry.callback.clone()).collect();
        entries.retain(|entry| !entry.once);
        snapshot
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.entries.get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for ListenerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.entries.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("ListenerTable").field("listeners", &counts).finish()
    }
}

/// Process-level observations that have no handle to be delivered to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Engine event whose identity maps to no live session
    UnroutableEvent { engine_id: String, kind: EventKind },
    /// Tolerated engine behaviour on a live session
    LifecycleAnomaly { handle: String, anomaly: Anomaly },
}

/// Drains the engine channel and fans events out to per-handle workers
///
/// Each handle gets its own ordered queue, so a session whose lock is held
/// across a slow engine call only delays its own events.
pub struct EventBus {
    registry: Weak<Registry>,
    rx: mpsc::UnboundedReceiver<EngineEnvelope>,
    registry_dropped: watch::Receiver<()>,
    workers: HashMap<Handle, mpsc::UnboundedSender<EngineEnvelope>>,
}

impl EventBus {
    pub(crate) fn new(
        registry: Weak<Registry>,
        rx: mpsc::UnboundedReceiver<EngineEnvelope>,
        registry_dropped: watch::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            rx,
            registry_dropped,
            workers: HashMap::new(),
        }
    }

    /// Process events until the engine channel closes or the registry is dropped
    pub async fn run(mut self) {
        info!("Event bus started");
        loop {
            let envelope = tokio::select! {
                _ = self.registry_dropped.changed() => None,
                envelope = self.rx.recv() => envelope,
            };
            let Some(envelope) = envelope else {
                break;
            };
            let Some(registry) = self.registry.upgrade() else {
                break;
            };
            self.route(&registry, envelope).await;
        }
        info!(workers = self.workers.len(), "Event bus stopped");
    }

    /// Hand an envelope to the worker owning its handle
    async fn route(&mut self, registry: &Registry, envelope: EngineEnvelope) {
        let Some(handle) = registry.handle_for_engine(&envelope.id).await else {
            unroutable(registry, &envelope.id, envelope.event.kind());
            return;
        };

        if let Some(worker) = self.workers.get(&handle) {
            match worker.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => {
                    self.workers.remove(&handle);
                    unroutable(registry, &envelope.id, envelope.event.kind());
                    return;
                }
            }
        }

        // Retire workers of closed sessions; their queues drain first
        let live: HashSet<Handle> = registry.handles().await.into_iter().collect();
        self.workers
            .retain(|handle, worker| !worker.is_closed() && live.contains(handle));

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SessionWorker {
            registry: self.registry.clone(),
            rx,
        };
        tokio::spawn(
            worker
                .run()
                .instrument(crate::session_span!(handle = %handle, op = "dispatch")),
        );
        if tx.send(envelope).is_ok() {
            self.workers.insert(handle, tx);
        }
    }
}

/// Applies one handle's events in arrival order
struct SessionWorker {
    registry: Weak<Registry>,
    rx: mpsc::UnboundedReceiver<EngineEnvelope>,
}

impl SessionWorker {
    async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            let Some(registry) = self.registry.upgrade() else {
                return;
            };
            dispatch(&registry, envelope).await;
        }
    }
}

/// Route a single envelope to its session
async fn dispatch(registry: &Registry, envelope: EngineEnvelope) {
    let EngineEnvelope { id, event } = envelope;
    let event = event.sanitized();
    let kind = event.kind();
    let metrics = registry.metrics();

    let Some(handle) = registry.handle_for_engine(&id).await else {
        unroutable(registry, &id, kind);
        return;
    };
    let Ok(session) = registry.resolve(&handle).await else {
        unroutable(registry, &id, kind);
        return;
    };

    let delivery = {
        let mut session = session.lock().await;
        if session.engine_id() != Some(&id) {
            debug!(handle = %handle, engine_id = %id, kind = %kind, "Dropping event from retired engine client");
            metrics.event_dropped();
            return;
        }

        let before = session.state();
        let transition = Lifecycle::on_engine_event(&session.lifecycle_context(), &event);
        if transition.is_noop(before) {
            debug!(handle = %handle, state = %before, kind = %kind, "Dropping event that does not apply to session state");
            metrics.event_dropped();
            return;
        }

        if let Some(anomaly) = transition.anomaly {
            warn!(handle = %handle, state = %before, anomaly = ?anomaly, "Engine lifecycle anomaly");
            registry.publish_diagnostic(Diagnostic::LifecycleAnomaly {
                handle: handle.to_string(),
                anomaly,
            });
        }

        let applied = session.apply(transition);
        if applied.next != before {
            debug!(handle = %handle, from = %before, to = %applied.next, "Session state changed");
        }

        if let Some(FollowUp::Disconnect) = applied.follow_up {
            let result = match session.client() {
                Some(client) => client.disconnect().await,
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!(handle = %handle, error = %e, "Deferred disconnect failed, session stays connected");
                session.set_state(SessionState::Connected);
            }
        }

        if let Some(mut client) = applied.retired_client {
            registry.forget_engine(client.id()).await;
            client.close().await;
        }

        applied.emit.map(|event| {
            let listeners = session.listeners_mut().snapshot(event.kind());
            (TaggedEvent { handle: handle.clone(), event }, listeners)
        })
    };

    if let Some((tagged, listeners)) = delivery {
        metrics.event_dispatched();
        for listener in listeners {
            listener(&tagged);
        }
    }
}

fn unroutable(registry: &Registry, id: &EngineId, kind: EventKind) {
    warn!(engine_id = %id, kind = %kind, "Dropping event for unknown engine client");
    registry.metrics().event_dropped();
    registry.publish_diagnostic(Diagnostic::UnroutableEvent {
        engine_id: id.to_string(),
        kind,
    });
}
