//! In-process event bus decoupling internal state changes from observers.
//!
//! Delivery is synchronous, in registration order, against a snapshot of the
//! listeners present when `emit` is called: listeners registered during a
//! delivery do not see that emission. A panicking listener is isolated and
//! logged; remaining listeners still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::warn;

use crate::types::{Channel, Message, ReadReceipt};

/// Reason attached to `connection.disconnected` events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// The caller requested the disconnect.
    Manual,
    /// The transport dropped unexpectedly.
    ConnectionLost,
}

impl DisconnectReason {
    /// Wire-style name of the reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

/// Typed events published on the bus, routed by their dotted name.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Realtime connection established.
    Connected,
    /// Realtime connection ended.
    Disconnected {
        /// Why the connection ended.
        reason: DisconnectReason,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt number within the current disconnection episode.
        attempt: u32,
    },
    /// The connection reported an error.
    ConnectionError {
        /// Human-readable error description.
        message: String,
    },
    /// A new message arrived.
    MessageNew { channel_id: String, message: Message },
    /// A message was edited.
    MessageUpdated { channel_id: String, message: Message },
    /// A message was deleted.
    MessageDeleted {
        channel_id: String,
        message_id: String,
    },
    /// A channel was created.
    ChannelCreated { channel: Channel },
    /// A channel was updated.
    ChannelUpdated { channel: Channel },
    /// A channel was deleted.
    ChannelDeleted { channel_id: String },
    /// A member joined a channel.
    MemberJoined {
        channel_id: String,
        user_id: String,
    },
    /// A member left a channel.
    MemberLeft {
        channel_id: String,
        user_id: String,
    },
    /// A user started typing.
    TypingStart {
        channel_id: String,
        user_id: String,
    },
    /// A user stopped typing.
    TypingStop {
        channel_id: String,
        user_id: String,
    },
    /// A read receipt arrived.
    ReadReceipt { receipt: ReadReceipt },
}

impl SessionEvent {
    /// Dotted event name used as the bus routing key.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connection.connected",
            Self::Disconnected { .. } => "connection.disconnected",
            Self::Reconnecting { .. } => "connection.reconnecting",
            Self::ConnectionError { .. } => "connection.error",
            Self::MessageNew { .. } => "message.new",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::ChannelCreated { .. } => "channel.created",
            Self::ChannelUpdated { .. } => "channel.updated",
            Self::ChannelDeleted { .. } => "channel.deleted",
            Self::MemberJoined { .. } => "channel.member.joined",
            Self::MemberLeft { .. } => "channel.member.left",
            Self::TypingStart { .. } => "typing.start",
            Self::TypingStop { .. } => "typing.stop",
            Self::ReadReceipt { .. } => "read.receipt",
        }
    }
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Entry {
    id: u64,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, Vec<Entry>>,
}

/// Publish/subscribe primitive shared by the SDK components.
#[derive(Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `event` and returns its removal handle.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), false)
    }

    /// Registers a listener removed after its first delivery.
    pub fn once<F>(&self, event: &str, listener: F) -> ListenerHandle
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(listener), true)
    }

    fn register(&self, event: &str, listener: Listener, once: bool) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut registry = lock(&self.registry);
        registry
            .listeners
            .entry(event.to_string())
            .or_default()
            .push(Entry { id, once, listener });
        ListenerHandle {
            registry: Arc::downgrade(&self.registry),
            event: event.to_string(),
            id,
        }
    }

    /// Delivers `event` to the listeners registered under its name.
    pub fn emit(&self, event: SessionEvent) {
        let snapshot: Vec<Listener> = {
            let mut registry = lock(&self.registry);
            let Some(entries) = registry.listeners.get_mut(event.name()) else {
                return;
            };
            let snapshot = entries.iter().map(|entry| entry.listener.clone()).collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                registry.listeners.remove(event.name());
            }
            snapshot
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(event = event.name(), "event listener panicked");
            }
        }
    }

    /// Removes every listener registered for `event`.
    ///
    /// Removing a single listener goes through its [`ListenerHandle`]; closure
    /// identity is not observable, so there is no removal-by-callback form.
    pub fn off(&self, event: &str) {
        lock(&self.registry).listeners.remove(event);
    }

    /// Removes listeners for one event, or every listener when `event` is
    /// `None`.
    pub fn remove_all(&self, event: Option<&str>) {
        let mut registry = lock(&self.registry);
        match event {
            Some(event) => {
                registry.listeners.remove(event);
            }
            None => registry.listeners.clear(),
        }
    }

    /// Number of listeners currently registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.registry)
            .listeners
            .get(event)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Names of events with at least one listener.
    pub fn event_names(&self) -> Vec<String> {
        lock(&self.registry).listeners.keys().cloned().collect()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|err| err.into_inner())
}

/// Removal handle returned by [`EventBus::on`] and [`EventBus::once`].
pub struct ListenerHandle {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: u64,
}

impl ListenerHandle {
    /// Removes the listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(entries) = registry.listeners.get_mut(&self.event) {
            entries.retain(|entry| entry.id != self.id);
            if entries.is_empty() {
                registry.listeners.remove(&self.event);
            }
        }
    }
}
