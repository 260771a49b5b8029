use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError, StorageResult,
};
use super::ids::{MemberId, MessageId};
use super::types::{
    DELETED_MESSAGE_CONTENT, MessagePatch, MessageRecord, NewMessage, ScopeKey, ScopeKind,
};
use super::{MessageStore, ScopeStore};

const MESSAGE_COLUMNS: &str =
    "id, scope_key, author_id, content, file_url, deleted, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic for QA checks.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Store calls open their own connection per worker thread; the pool only bootstraps.
        pool.close().await;

        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ScopeStore for SqliteStorage {
    fn register_scope(&self, scope: ScopeKey) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("scope-register", async move {
            let mut connection =
                connect_store_connection(&database_url, "scope-register-connect").await?;
            sqlx::query(
                "INSERT INTO scopes (scope_key, kind, created_at) VALUES (?, ?, ?) ON CONFLICT (scope_key) DO NOTHING",
            )
            .bind(scope.to_string())
            .bind(kind_to_sql(scope.kind()))
            .bind(unix_timestamp_millis())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "scope-register-insert",
            })?;

            Ok(())
        })
    }

    fn scope_exists(&self, scope: ScopeKey) -> StorageResult<bool> {
        let database_url = self.database_url.clone();
        self.run_db_call("scope-exists", async move {
            let mut connection =
                connect_store_connection(&database_url, "scope-exists-connect").await?;
            scope_exists(&mut connection, scope).await
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(&self, scope: ScopeKey, input: NewMessage) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            ensure_scope(&mut connection, scope, "message-append-scope-missing").await?;

            let now = unix_timestamp_millis();
            let message_id = MessageId::new_v7();

            sqlx::query(
                "INSERT INTO messages (id, scope_key, author_id, content, file_url, deleted, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(scope.to_string())
            .bind(input.author_id.to_string())
            .bind(input.content.clone())
            .bind(input.file_url.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            let timestamp = i64_to_u64(now, "message-append-created-at")?;
            Ok(MessageRecord {
                id: message_id,
                scope,
                author_id: input.author_id,
                content: input.content,
                file_url: input.file_url,
                deleted: false,
                created_at_unix_millis: timestamp,
                updated_at_unix_millis: timestamp,
            })
        })
    }

    fn fetch_page(
        &self,
        scope: ScopeKey,
        cursor: Option<MessageId>,
        batch_size: usize,
    ) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-fetch-page", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-fetch-page-connect").await?;
            ensure_scope(&mut connection, scope, "message-fetch-page-scope-missing").await?;

            let limit = usize_to_i64(batch_size, "message-fetch-page-limit")?;
            let rows = match cursor {
                None => {
                    let query = format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE scope_key = ? ORDER BY created_at DESC, id DESC LIMIT ?"
                    );
                    sqlx::query_as::<_, MessageRow>(&query)
                        .bind(scope.to_string())
                        .bind(limit)
                        .fetch_all(&mut connection)
                        .await
                        .context(SqliteQuerySnafu {
                            stage: "message-fetch-page-newest",
                        })?
                }
                Some(cursor) => {
                    let cursor_created_at = sqlx::query_scalar::<_, i64>(
                        "SELECT created_at FROM messages WHERE scope_key = ? AND id = ?",
                    )
                    .bind(scope.to_string())
                    .bind(cursor.to_string())
                    .fetch_optional(&mut connection)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "message-fetch-page-cursor",
                    })?;

                    // Cursor rows are excluded from the page, mirroring `skip: 1` cursor semantics.
                    let Some(cursor_created_at) = cursor_created_at else {
                        return Ok(Vec::new());
                    };

                    let query = format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE scope_key = ? AND (created_at < ? OR (created_at = ? AND id < ?)) ORDER BY created_at DESC, id DESC LIMIT ?"
                    );
                    sqlx::query_as::<_, MessageRow>(&query)
                        .bind(scope.to_string())
                        .bind(cursor_created_at)
                        .bind(cursor_created_at)
                        .bind(cursor.to_string())
                        .bind(limit)
                        .fetch_all(&mut connection)
                        .await
                        .context(SqliteQuerySnafu {
                            stage: "message-fetch-page-older",
                        })?
                }
            };

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn get_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
    ) -> StorageResult<Option<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-get-connect").await?;
            load_message(&mut connection, scope, message_id, "message-get-query").await
        })
    }

    fn update_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
        patch: MessagePatch,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-update", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-update-connect").await?;
            let update_result = sqlx::query(
                "UPDATE messages SET content = COALESCE(?, content), updated_at = ? WHERE scope_key = ? AND id = ? AND deleted = 0",
            )
            .bind(patch.content)
            .bind(unix_timestamp_millis())
            .bind(scope.to_string())
            .bind(message_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-update-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            load_message(&mut connection, scope, message_id, "message-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-update-load-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })
        })
    }

    fn soft_delete_message(
        &self,
        scope: ScopeKey,
        message_id: MessageId,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-soft-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-soft-delete-connect").await?;
            let delete_result = sqlx::query(
                "UPDATE messages SET content = ?, file_url = NULL, deleted = 1, updated_at = ? WHERE scope_key = ? AND id = ?",
            )
            .bind(DELETED_MESSAGE_CONTENT)
            .bind(unix_timestamp_millis())
            .bind(scope.to_string())
            .bind(message_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-soft-delete-apply",
            })?;

            if delete_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-soft-delete-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            load_message(&mut connection, scope, message_id, "message-soft-delete-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "message-soft-delete-load-missing",
                    entity: "message",
                    id: message_id.to_string(),
                })
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    scope_key: String,
    author_id: String,
    content: String,
    file_url: Option<String>,
    deleted: bool,
    created_at: i64,
    updated_at: i64,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        scope: ScopeKey::parse(&row.scope_key)?,
        author_id: MemberId::parse(&row.author_id)?,
        content: row.content,
        file_url: row.file_url,
        deleted: row.deleted,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "message-row-updated-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn scope_exists(connection: &mut SqliteConnection, scope: ScopeKey) -> StorageResult<bool> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM scopes WHERE scope_key = ?")
        .bind(scope.to_string())
        .fetch_one(&mut *connection)
        .await
        .context(SqliteQuerySnafu {
            stage: "scope-exists-query",
        })?;

    Ok(count > 0)
}

async fn ensure_scope(
    connection: &mut SqliteConnection,
    scope: ScopeKey,
    stage: &'static str,
) -> StorageResult<()> {
    if scope_exists(connection, scope).await? {
        return Ok(());
    }

    NotFoundSnafu {
        stage,
        entity: "scope",
        id: scope.to_string(),
    }
    .fail()
}

async fn load_message(
    connection: &mut SqliteConnection,
    scope: ScopeKey,
    message_id: MessageId,
    stage: &'static str,
) -> StorageResult<Option<MessageRecord>> {
    let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE scope_key = ? AND id = ?");
    let row = sqlx::query_as::<_, MessageRow>(&query)
        .bind(scope.to_string())
        .bind(message_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    row.map(message_row_to_record).transpose()
}

fn kind_to_sql(kind: ScopeKind) -> &'static str {
    match kind {
        ScopeKind::Channel => "channel",
        ScopeKind::Conversation => "conversation",
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChannelId;

    async fn open_seeded(dir: &tempfile::TempDir, messages: usize) -> (SqliteStorage, ScopeKey) {
        let path = dir.path().join("parley.sqlite3");
        let storage = SqliteStorage::open(&path.display().to_string())
            .await
            .unwrap();
        let scope = ScopeKey::Channel(ChannelId::new_v7());
        storage.register_scope(scope).unwrap();

        let author = MemberId::new_v7();
        for index in 0..messages {
            storage
                .append_message(
                    scope,
                    NewMessage::text(author, format!("message-{index}")).unwrap(),
                )
                .unwrap();
        }

        (storage, scope)
    }

    #[tokio::test]
    async fn paging_walks_history_newest_first_and_ends_on_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, scope) = open_seeded(&dir, 13).await;

        let first = storage.fetch_page(scope, None, 10).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].content, "message-12");
        assert_eq!(first[9].content, "message-3");

        let second = storage.fetch_page(scope, Some(first[9].id), 10).unwrap();
        let contents = second
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["message-2", "message-1", "message-0"]);
    }

    #[tokio::test]
    async fn unknown_scope_and_unknown_cursor_are_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, scope) = open_seeded(&dir, 2).await;

        let missing_scope = ScopeKey::Channel(ChannelId::new_v7());
        let error = storage.fetch_page(missing_scope, None, 10).unwrap_err();
        assert!(error.is_unknown_scope());

        let empty = storage
            .fetch_page(scope, Some(MessageId::new_v7()), 10)
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn soft_delete_keeps_the_row_and_blanks_content() {
        let dir = tempfile::tempdir().unwrap();
        let (storage, scope) = open_seeded(&dir, 1).await;
        let original = storage.fetch_page(scope, None, 10).unwrap().remove(0);

        let edited = storage
            .update_message(
                scope,
                original.id,
                MessagePatch {
                    content: Some("edited".to_string()),
                },
            )
            .unwrap();
        assert_eq!(edited.content, "edited");
        assert_eq!(edited.created_at_unix_millis, original.created_at_unix_millis);

        let deleted = storage.soft_delete_message(scope, original.id).unwrap();
        assert!(deleted.deleted);
        assert_eq!(deleted.content, DELETED_MESSAGE_CONTENT);

        // Deleted rows stay addressable so live views can render the tombstone in place.
        let page = storage.fetch_page(scope, None, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].deleted);

        let fetched = storage.get_message(scope, original.id).unwrap();
        assert_eq!(fetched.as_ref(), Some(&deleted));
        assert!(deleted.is_revision_of(&original));
        assert!(storage.get_message(scope, MessageId::new_v7()).unwrap().is_none());

        let update_after_delete = storage.update_message(scope, original.id, MessagePatch::default());
        assert!(matches!(
            update_after_delete,
            Err(StorageError::NotFound {
                entity: "message",
                ..
            })
        ));
    }
}
