use parking_lot::RwLock;
use parley_storage::ScopeKey;
use tokio::sync::watch;

use crate::events::Message;
use crate::page::PageSet;

/// Shared page cache for one scope. Every effective mutation bumps a revision counter
/// observers can wait on. The lock is never held across an await.
#[derive(Debug)]
pub struct ScopeCache {
    scope: ScopeKey,
    pages: RwLock<PageSet>,
    revision: watch::Sender<u64>,
}

impl ScopeCache {
    pub fn new(scope: ScopeKey) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            scope,
            pages: RwLock::new(PageSet::new(scope)),
            revision,
        }
    }

    pub fn scope(&self) -> ScopeKey {
        self.scope
    }

    pub fn read<R>(&self, reader: impl FnOnce(&PageSet) -> R) -> R {
        reader(&self.pages.read())
    }

    /// Runs `mutation` under the write lock. The revision moves only when it reports a change.
    pub fn mutate<R>(&self, mutation: impl FnOnce(&mut PageSet) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut pages = self.pages.write();
            mutation(&mut pages)
        };
        if changed {
            self.revision.send_modify(|revision| *revision += 1);
        }
        result
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.read(PageSet::flattened)
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::tests::{message, scope};

    #[test]
    fn revision_moves_only_on_change() {
        let scope = scope();
        let cache = ScopeCache::new(scope);
        let receiver = cache.subscribe();
        let live = message(scope, "A", 1);

        assert!(cache.mutate(|set| {
            let inserted = set.prepend_created(live.clone());
            (inserted, inserted)
        }));
        assert_eq!(cache.revision(), 1);
        assert!(receiver.has_changed().unwrap_or(false));

        cache.mutate(|set| {
            let inserted = set.prepend_created(live.clone());
            (inserted, inserted)
        });
        assert_eq!(cache.revision(), 1);
        assert_eq!(cache.snapshot().len(), 1);
    }
}
