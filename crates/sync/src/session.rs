use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use parley_storage::ScopeKey;
use tokio::sync::watch;

use crate::autoscroll::AutoscrollController;
use crate::cache::ScopeCache;
use crate::error::{ScopeAlreadyOpenSnafu, SyncResult};
use crate::events::Message;
use crate::fallback::FallbackScheduler;
use crate::live::{LiveChannel, Subscription};
use crate::page::Page;
use crate::page_store::PageStore;
use crate::reconciler::Reconciler;
use crate::settings::SyncSettings;
use crate::source::PageSource;

struct SessionInner {
    live: LiveChannel,
    source: Arc<dyn PageSource>,
    settings: Arc<SyncSettings>,
    scopes: RwLock<HashMap<ScopeKey, Arc<ScopeCache>>>,
}

impl SessionInner {
    fn unregister(&self, scope: ScopeKey, cache: &Arc<ScopeCache>) {
        let mut scopes = self.scopes.write();
        if scopes
            .get(&scope)
            .is_some_and(|registered| Arc::ptr_eq(registered, cache))
        {
            scopes.remove(&scope);
        }
    }
}

/// One per signed-in session: shares the live channel and page source across every open
/// scope and keeps the registry of scope caches.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl SessionContext {
    pub fn new(live: LiveChannel, source: Arc<dyn PageSource>, settings: Arc<SyncSettings>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                live,
                source,
                settings,
                scopes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn live(&self) -> &LiveChannel {
        &self.inner.live
    }

    pub fn settings(&self) -> &Arc<SyncSettings> {
        &self.inner.settings
    }

    /// Opens `scope`: attaches a reconciler, loads the newest page and starts the fallback
    /// worker. Nothing stays registered when the initial load fails.
    pub async fn open_scope(&self, scope: ScopeKey) -> SyncResult<ScopeHandle> {
        let cache = Arc::new(ScopeCache::new(scope));
        {
            let mut scopes = self.inner.scopes.write();
            if scopes.contains_key(&scope) {
                return ScopeAlreadyOpenSnafu {
                    stage: "session-open-scope",
                    scope,
                }
                .fail();
            }
            scopes.insert(scope, Arc::clone(&cache));
        }
        let mut pending = PendingScope {
            inner: &self.inner,
            scope,
            cache: &cache,
            armed: true,
        };

        let settings = &self.inner.settings;
        let store = Arc::new(PageStore::new(
            scope,
            Arc::clone(&self.inner.source),
            settings.batch_size,
            Arc::clone(&cache),
        ));
        // Subscribe before the first fetch so events racing the load are not lost.
        let subscriptions = Reconciler::new(Arc::clone(&cache)).attach(&self.inner.live);

        if let Err(error) = store.load_next().await {
            drop(subscriptions);
            tracing::warn!(scope = %scope, error = %error, "scope open failed");
            return Err(error);
        }

        pending.armed = false;
        let fallback = FallbackScheduler::spawn(
            Arc::clone(&store),
            self.inner.live.watch_connection(),
            settings.fallback_interval(),
        );
        tracing::info!(
            scope = %scope,
            loaded = cache.read(|set| set.message_count()),
            "scope opened"
        );

        Ok(ScopeHandle {
            session: Arc::downgrade(&self.inner),
            store,
            subscriptions,
            fallback: Some(fallback),
            autoscroll: AutoscrollController::new(settings.autoscroll_threshold),
        })
    }

    /// Cache of an open scope, if any.
    pub fn scope(&self, scope: ScopeKey) -> Option<Arc<ScopeCache>> {
        self.inner.scopes.read().get(&scope).cloned()
    }

    pub fn open_scopes(&self) -> Vec<ScopeKey> {
        let mut scopes: Vec<_> = self.inner.scopes.read().keys().copied().collect();
        scopes.sort();
        scopes
    }
}

/// Rolls back the registry entry if `open_scope` fails or is cancelled midway.
struct PendingScope<'a> {
    inner: &'a SessionInner,
    scope: ScopeKey,
    cache: &'a Arc<ScopeCache>,
    armed: bool,
}

impl Drop for PendingScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.unregister(self.scope, self.cache);
        }
    }
}

/// A scope opened in a [`SessionContext`]. Closing or dropping it releases the live
/// subscriptions, stops polling and removes the scope from the registry.
pub struct ScopeHandle {
    session: Weak<SessionInner>,
    store: Arc<PageStore>,
    subscriptions: Vec<Subscription>,
    fallback: Option<FallbackScheduler>,
    autoscroll: AutoscrollController,
}

impl ScopeHandle {
    pub fn scope(&self) -> ScopeKey {
        self.store.scope()
    }

    pub fn store(&self) -> &Arc<PageStore> {
        &self.store
    }

    pub async fn load_next(&self) -> SyncResult<Option<Page>> {
        self.store.load_next().await
    }

    pub fn has_more(&self) -> bool {
        self.store.has_more()
    }

    pub fn is_fetching_next(&self) -> bool {
        self.store.is_fetching_next()
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.store.current_messages()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.store.changes()
    }

    pub fn autoscroll(&self) -> &AutoscrollController {
        &self.autoscroll
    }

    pub fn autoscroll_mut(&mut self) -> &mut AutoscrollController {
        &mut self.autoscroll
    }

    /// Tears the scope down and waits for the fallback worker to exit.
    pub async fn close(mut self) {
        self.release_subscriptions();
        if let Some(fallback) = self.fallback.take() {
            fallback.shutdown().await;
        }
        self.unregister();
        tracing::info!(scope = %self.scope(), "scope closed");
    }

    fn release_subscriptions(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.dispose();
        }
    }

    fn unregister(&self) {
        if let Some(session) = self.session.upgrade() {
            session.unregister(self.store.scope(), self.store.cache());
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        self.release_subscriptions();
        self.fallback.take();
        self.unregister();
    }
}
