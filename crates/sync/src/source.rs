use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parley_storage::{MessageId, MessageStore, ScopeKey};
use snafu::ResultExt;

use crate::error::{SyncError, SyncResult, TransportSnafu};
use crate::events::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Backend able to serve cursor-paged history for a scope.
///
/// Implementations return at most `batch_size` messages newest first, strictly older than
/// `cursor`. A short page is the end-of-history signal.
pub trait PageSource: Send + Sync {
    fn fetch_page<'a>(
        &'a self,
        scope: &'a ScopeKey,
        cursor: Option<MessageId>,
        batch_size: usize,
    ) -> BoxFuture<'a, SyncResult<Vec<Message>>>;
}

/// Serves pages straight from a [`MessageStore`], off the async runtime.
pub struct StoragePageSource<S> {
    store: Arc<S>,
}

impl<S> StoragePageSource<S>
where
    S: MessageStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> PageSource for StoragePageSource<S>
where
    S: MessageStore + 'static,
{
    fn fetch_page<'a>(
        &'a self,
        scope: &'a ScopeKey,
        cursor: Option<MessageId>,
        batch_size: usize,
    ) -> BoxFuture<'a, SyncResult<Vec<Message>>> {
        let store = Arc::clone(&self.store);
        let scope = *scope;
        Box::pin(async move {
            let fetched =
                tokio::task::spawn_blocking(move || store.fetch_page(scope, cursor, batch_size))
                    .await
                    .map_err(|error| Box::new(error) as crate::error::BoxedError)
                    .context(TransportSnafu {
                        stage: "storage-page-source-join",
                        scope,
                    })?;
            fetched.map_err(|error| SyncError::from_storage("storage-page-source-fetch", scope, error))
        })
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::{ConversationId, MemberId, NewMessage, ScopeStore, SqliteStorage};

    use super::*;

    async fn open_store() -> (tempfile::TempDir, Arc<SqliteStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.sqlite3");
        let store = SqliteStorage::open(&path.display().to_string())
            .await
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_scope_maps_to_scope_error() {
        let (_dir, store) = open_store().await;
        let source = StoragePageSource::new(store);
        let scope = ScopeKey::Conversation(ConversationId::new_v7());

        let error = source
            .fetch_page(&scope, None, 10)
            .await
            .expect_err("unregistered scope should fail");
        assert!(matches!(error, SyncError::Scope { .. }));
        assert!(!error.is_retryable());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registered_scope_pages_newest_first() {
        let (_dir, store) = open_store().await;
        let scope = ScopeKey::Conversation(ConversationId::new_v7());
        store.register_scope(scope).expect("scope should register");
        let author = MemberId::new_v7();
        for index in 0..3 {
            let input = NewMessage::text(author, format!("m{index}")).expect("valid message");
            store.append_message(scope, input).expect("append should succeed");
        }

        let source = StoragePageSource::new(store);
        let page = source
            .fetch_page(&scope, None, 10)
            .await
            .expect("fetch should succeed");
        let contents: Vec<_> = page.iter().map(|message| message.content.as_str()).collect();
        assert_eq!(contents, ["m2", "m1", "m0"]);
    }
}
