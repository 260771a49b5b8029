use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::events::{ConnectionState, EventKind, LiveEvent};
use crate::wire::{LiveFrame, decode_frame};

pub type EventHandler = Arc<dyn Fn(&LiveEvent) + Send + Sync + 'static>;

/// What a push transport reports to the channel.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    Connected,
    Disconnected,
    Frame(LiveFrame),
}

struct LiveChannelInner {
    handlers: RwLock<HashMap<EventKind, Vec<(u64, EventHandler)>>>,
    next_subscription_id: AtomicU64,
    connection: watch::Sender<ConnectionState>,
}

/// Fan-out point for live message events plus the shared connection flag.
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<LiveChannelInner>,
}

impl Default for LiveChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveChannel {
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(LiveChannelInner {
                handlers: RwLock::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
                connection,
            }),
        }
    }

    /// Registers `handler` for one event kind until the returned handle is disposed or dropped.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&LiveEvent) + Send + Sync + 'static,
    {
        let id = self
            .inner
            .next_subscription_id
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        tracing::trace!(?kind, subscription = id, "live handler registered");

        Subscription {
            channel: Arc::downgrade(&self.inner),
            kind,
            id,
            active: true,
        }
    }

    /// Delivers `event` to every handler of its kind. A panicking handler is logged and
    /// does not stop delivery to the rest.
    pub fn dispatch(&self, event: &LiveEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .read()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(
                    ?kind,
                    scope = %event.scope(),
                    message_id = %event.message().id,
                    "live handler panicked"
                ),
            }
        }
        delivered
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let changed = self.inner.connection.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(?state, "live connection state changed");
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Drives the channel from a transport until the stream ends, then marks it disconnected.
    /// Frames that fail to decode are logged and skipped.
    pub async fn run_transport<S>(&self, signals: S)
    where
        S: Stream<Item = TransportSignal>,
    {
        let mut signals = std::pin::pin!(signals);
        while let Some(signal) = signals.next().await {
            match signal {
                TransportSignal::Connected => {
                    self.set_connection_state(ConnectionState::Connected);
                }
                TransportSignal::Disconnected => {
                    self.set_connection_state(ConnectionState::Disconnected);
                }
                TransportSignal::Frame(frame) => match decode_frame(&frame) {
                    Ok(event) => {
                        self.dispatch(&event);
                    }
                    Err(error) => {
                        tracing::warn!(event = %frame.event, error = %error, "dropping live frame");
                    }
                },
            }
        }
        self.set_connection_state(ConnectionState::Disconnected);
    }
}

fn remove_handler(inner: &LiveChannelInner, kind: EventKind, id: u64) {
    let mut handlers = inner.handlers.write();
    if let Some(entries) = handlers.get_mut(&kind) {
        entries.retain(|(entry_id, _)| *entry_id != id);
        if entries.is_empty() {
            handlers.remove(&kind);
        }
    }
}

/// Deregisters its handler on [`Subscription::dispose`] or drop.
pub struct Subscription {
    channel: Weak<LiveChannelInner>,
    kind: EventKind,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.channel.upgrade() {
            remove_handler(&inner, self.kind, self.id);
            tracing::trace!(kind = ?self.kind, subscription = self.id, "live handler released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
