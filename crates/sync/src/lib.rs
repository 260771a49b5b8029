//! Real-time message sync for chat scopes.
//!
//! A [`SessionContext`] shares one [`LiveChannel`] across every open scope. Each scope
//! keeps a cursor-paged [`PageStore`] over a [`ScopeCache`], a [`Reconciler`] folding
//! live events into that cache, and a [`FallbackScheduler`] that polls the newest page
//! while the live connection is down.

pub mod autoscroll;
pub mod cache;
pub mod error;
pub mod events;
pub mod fallback;
pub mod live;
pub mod page;
pub mod page_store;
pub mod reconciler;
pub mod session;
pub mod settings;
pub mod source;
pub mod wire;

pub use autoscroll::{
    AutoscrollController, ContentChange, DEFAULT_AUTOSCROLL_THRESHOLD, Viewport, should_autoscroll,
};
pub use cache::ScopeCache;
pub use error::{SyncError, SyncResult};
pub use events::{ConnectionState, EventKind, LiveEvent, Message};
pub use fallback::FallbackScheduler;
pub use live::{LiveChannel, Subscription, TransportSignal};
pub use page::{Page, PageOrigin, PageSet};
pub use page_store::PageStore;
pub use reconciler::{ApplyOutcome, DeliveryAnomaly, Reconciler};
pub use session::{ScopeHandle, SessionContext};
pub use settings::{SettingsError, SettingsStore, SyncSettings};
pub use source::{BoxFuture, PageSource, StoragePageSource};
pub use wire::{LiveFrame, WireError, decode_frame, encode_event, event_key};
