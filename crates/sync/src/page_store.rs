use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_storage::ScopeKey;
use tokio::sync::{Mutex, watch};

use crate::cache::ScopeCache;
use crate::error::SyncResult;
use crate::events::Message;
use crate::page::Page;
use crate::source::PageSource;

/// Cursor-paged history for one scope, backed by a shared [`ScopeCache`].
///
/// Loads are serialized so the cursor chain never forks; a second `load_next` waits for the
/// first and then continues from the cursor it produced.
pub struct PageStore {
    scope: ScopeKey,
    source: Arc<dyn PageSource>,
    batch_size: usize,
    cache: Arc<ScopeCache>,
    load_gate: Mutex<()>,
    fetching_next: AtomicBool,
}

impl PageStore {
    pub fn new(
        scope: ScopeKey,
        source: Arc<dyn PageSource>,
        batch_size: usize,
        cache: Arc<ScopeCache>,
    ) -> Self {
        Self {
            scope,
            source,
            batch_size: batch_size.max(1),
            cache,
            load_gate: Mutex::new(()),
            fetching_next: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> ScopeKey {
        self.scope
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn cache(&self) -> &Arc<ScopeCache> {
        &self.cache
    }

    /// Fetches the next older page and appends it.
    ///
    /// Returns `Ok(None)` without touching the source once history is exhausted. A failed
    /// fetch leaves the cache unchanged so the call can be retried.
    pub async fn load_next(&self) -> SyncResult<Option<Page>> {
        let _gate = self.load_gate.lock().await;
        if !self.has_more() {
            return Ok(None);
        }

        let cursor = self.cache.read(|set| set.next_cursor());
        let fetching = FetchingFlag::raise(&self.fetching_next);
        let fetched = self
            .source
            .fetch_page(&self.scope, cursor, self.batch_size)
            .await;
        drop(fetching);

        let messages = match fetched {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(
                    scope = %self.scope,
                    cursor = ?cursor,
                    retryable = error.is_retryable(),
                    error = %error,
                    "history page fetch failed"
                );
                return Err(error);
            }
        };

        let page = Page::from_fetch(self.scope, messages, self.batch_size);
        let fetched_len = page.messages.len();
        let stored = self.cache.mutate(|set| (set.append_fetched(page), true));
        tracing::debug!(
            scope = %self.scope,
            cursor = ?cursor,
            fetched = fetched_len,
            appended = stored.messages.len(),
            exhausted = stored.is_terminal(),
            "history page loaded"
        );
        Ok(Some(stored))
    }

    pub fn has_more(&self) -> bool {
        self.cache.read(|set| set.has_more())
    }

    pub fn is_fetching_next(&self) -> bool {
        self.fetching_next.load(Ordering::Acquire)
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.cache.snapshot()
    }

    /// Re-fetches the newest page and merges it. Returns how many messages changed.
    pub async fn refresh_newest(&self) -> SyncResult<usize> {
        let fresh = self
            .source
            .fetch_page(&self.scope, None, self.batch_size)
            .await?;
        let page = Page::from_fetch(self.scope, fresh, self.batch_size);
        let changed = self.cache.mutate(|set| {
            let changed = set.merge_newest(page);
            (changed, changed > 0)
        });
        if changed > 0 {
            tracing::debug!(scope = %self.scope, changed, "newest page refreshed");
        }
        Ok(changed)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.cache.subscribe()
    }
}

/// Holds `is_fetching_next` up for one fetch and lowers it even if the load is cancelled.
struct FetchingFlag<'a>(&'a AtomicBool);

impl<'a> FetchingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for FetchingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex as SyncMutex;
    use parley_storage::MessageId;

    use super::*;
    use crate::error::{BoxedError, SyncError};
    use crate::page::tests::{message, scope};
    use crate::source::BoxFuture;

    struct ScriptedSource {
        responses: SyncMutex<VecDeque<SyncResult<Vec<Message>>>>,
        cursors: SyncMutex<Vec<Option<MessageId>>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<SyncResult<Vec<Message>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: SyncMutex::new(responses.into()),
                cursors: SyncMutex::new(Vec::new()),
            })
        }
    }

    impl PageSource for ScriptedSource {
        fn fetch_page<'a>(
            &'a self,
            _scope: &'a ScopeKey,
            cursor: Option<MessageId>,
            _batch_size: usize,
        ) -> BoxFuture<'a, SyncResult<Vec<Message>>> {
            self.cursors.lock().push(cursor);
            let next = self.responses.lock().pop_front().unwrap_or(Ok(Vec::new()));
            Box::pin(async move { next })
        }
    }

    fn transport_error(scope: ScopeKey) -> SyncError {
        SyncError::Transport {
            stage: "test",
            scope,
            source: BoxedError::from("connection reset"),
        }
    }

    #[tokio::test]
    async fn load_next_follows_cursor_and_stops_after_short_page() {
        let scope = scope();
        let first: Vec<_> = (0..3).map(|at| message(scope, "a", 100 - at)).collect();
        let second = vec![message(scope, "b", 50)];
        let source = ScriptedSource::new(vec![Ok(first.clone()), Ok(second)]);
        let store = PageStore::new(scope, source.clone(), 3, Arc::new(ScopeCache::new(scope)));

        assert!(store.has_more());
        store.load_next().await.unwrap().unwrap();
        assert!(store.has_more());
        let last = store.load_next().await.unwrap().unwrap();
        assert!(last.is_terminal());
        assert!(!store.has_more());

        assert!(store.load_next().await.unwrap().is_none());
        assert_eq!(
            *source.cursors.lock(),
            vec![None, first.last().map(|message| message.id)]
        );
        assert_eq!(store.current_messages().len(), 4);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_untouched_and_retries_same_cursor() {
        let scope = scope();
        let page: Vec<_> = (0..2).map(|at| message(scope, "a", 100 - at)).collect();
        let source = ScriptedSource::new(vec![Err(transport_error(scope)), Ok(page)]);
        let store = PageStore::new(scope, source.clone(), 10, Arc::new(ScopeCache::new(scope)));

        let error = store.load_next().await.unwrap_err();
        assert!(error.is_retryable());
        assert!(store.current_messages().is_empty());
        assert!(store.has_more());
        assert!(!store.is_fetching_next());

        store.load_next().await.unwrap();
        assert_eq!(*source.cursors.lock(), vec![None, None]);
        assert_eq!(store.current_messages().len(), 2);
    }

    #[tokio::test]
    async fn refresh_newest_merges_without_touching_cursor_chain() {
        let scope = scope();
        let loaded: Vec<_> = (0..2).map(|at| message(scope, "old", 100 - at)).collect();
        let arrived = message(scope, "new", 200);
        let mut fresh = vec![arrived.clone()];
        fresh.extend(loaded.clone());
        let source = ScriptedSource::new(vec![Ok(loaded), Ok(fresh)]);
        let store = PageStore::new(scope, source, 10, Arc::new(ScopeCache::new(scope)));

        store.load_next().await.unwrap();
        let before = store.cache().revision();
        assert_eq!(store.refresh_newest().await.unwrap(), 1);
        assert!(store.cache().revision() > before);
        assert_eq!(store.current_messages()[0], arrived);
        assert!(!store.has_more());
    }

    struct StalledSource;

    impl PageSource for StalledSource {
        fn fetch_page<'a>(
            &'a self,
            _scope: &'a ScopeKey,
            _cursor: Option<MessageId>,
            _batch_size: usize,
        ) -> BoxFuture<'a, SyncResult<Vec<Message>>> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_load_clears_fetching_flag_and_gate() {
        let scope = scope();
        let store = PageStore::new(
            scope,
            Arc::new(StalledSource),
            10,
            Arc::new(ScopeCache::new(scope)),
        );

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(20), store.load_next()).await;
        assert!(abandoned.is_err());
        assert!(!store.is_fetching_next());
        assert!(store.current_messages().is_empty());
        assert!(store.has_more());

        // The load gate was released with the dropped future, so a new load can start.
        let retried =
            tokio::time::timeout(std::time::Duration::from_millis(20), store.load_next()).await;
        assert!(retried.is_err());
        assert!(!store.is_fetching_next());
    }
}
