use parley_storage::ScopeKey;

pub use parley_storage::MessageRecord as Message;

/// Which of the two per-scope push streams a live event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
}

impl EventKind {
    pub const ALL: [EventKind; 2] = [EventKind::Created, EventKind::Updated];
}

/// A push notification carrying the full message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Created(Message),
    Updated(Message),
}

impl LiveEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Created(_) => EventKind::Created,
            Self::Updated(_) => EventKind::Updated,
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Self::Created(message) | Self::Updated(message) => message,
        }
    }

    pub fn scope(&self) -> ScopeKey {
        self.message().scope
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}
