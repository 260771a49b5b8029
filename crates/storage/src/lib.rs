pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{ChannelId, ConversationId, MemberId, MessageId};
pub use sqlite::SqliteStorage;
pub use types::{
    DEFAULT_MESSAGES_BATCH, DELETED_MESSAGE_CONTENT, MessagePatch, MessageRecord, NewMessage,
    ScopeKey, ScopeKind,
};

pub trait ScopeStore: Send + Sync {
    /// Registers a scope so messages can be written to and paged from it.
    fn register_scope(&self, scope: ScopeKey) -> StorageResult<()>;
    fn scope_exists(&self, scope: ScopeKey) -> StorageResult<bool>;
}

pub trait MessageStore: Send + Sync {
    fn append_message(&self, scope: ScopeKey, input: NewMessage) -> StorageResult<MessageRecord>;
    /// Returns at most `batch_size` messages, newest first, strictly older than `cursor`.
    ///
    /// A result shorter than `batch_size` is the only end-of-history signal; an unknown
    /// cursor yields an empty page.
    fn fetch_page(
        &self,
        scope: ScopeKey,
        cursor: Option<MessageId>,
        batch_size: usize,
    ) -> StorageResult<Vec<MessageRecord>>;
    fn get_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
    ) -> StorageResult<Option<MessageRecord>>;
    fn update_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> StorageResult<MessageRecord>;
    fn soft_delete_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
    ) -> StorageResult<MessageRecord>;
}

pub trait Storage: ScopeStore + MessageStore {}

impl<T> Storage for T where T: ScopeStore + MessageStore {}
