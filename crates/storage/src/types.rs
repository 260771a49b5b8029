use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::error::{ConflictSnafu, InvalidScopeKeySnafu, StorageError, StorageResult};
use super::ids::{ChannelId, ConversationId, MemberId, MessageId};

/// Page size used by the message history endpoints.
pub const DEFAULT_MESSAGES_BATCH: usize = 10;

/// Content written over a message when it is soft-deleted.
pub const DELETED_MESSAGE_CONTENT: &str = "This message has been deleted.";

/// The conversation or channel a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopeKey {
    Channel(ChannelId),
    Conversation(ConversationId),
}

impl ScopeKey {
    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Channel(_) => ScopeKind::Channel,
            Self::Conversation(_) => ScopeKind::Conversation,
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let Some((kind, id)) = raw.split_once(':') else {
            return InvalidScopeKeySnafu {
                stage: "parse-scope-key-split",
                raw: raw.to_string(),
                details: "expected '<kind>:<uuid>'",
            }
            .fail();
        };

        match kind {
            "channel" => Ok(Self::Channel(ChannelId::parse(id)?)),
            "conversation" => Ok(Self::Conversation(ConversationId::parse(id)?)),
            _ => InvalidScopeKeySnafu {
                stage: "parse-scope-key-kind",
                raw: raw.to_string(),
                details: "kind must be 'channel' or 'conversation'",
            }
            .fail(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(formatter, "channel:{id}"),
            Self::Conversation(id) => write!(formatter, "conversation:{id}"),
        }
    }
}

impl FromStr for ScopeKey {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for ScopeKey {
    type Error = StorageError;

    fn try_from(raw: String) -> StorageResult<Self> {
        Self::parse(&raw)
    }
}

impl From<ScopeKey> for String {
    fn from(value: ScopeKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Channel,
    Conversation,
}

/// One chat message as storage and the push transport see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(rename = "scopeKey")]
    pub scope: ScopeKey,
    #[serde(rename = "memberId")]
    pub author_id: MemberId,
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(rename = "createdAt")]
    pub created_at_unix_millis: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at_unix_millis: u64,
}

impl MessageRecord {
    /// Returns true when both records describe the same message with different mutable fields.
    pub fn is_revision_of(&self, other: &MessageRecord) -> bool {
        self.id == other.id && self != other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub author_id: MemberId,
    pub content: String,
    pub file_url: Option<String>,
}

impl NewMessage {
    pub fn text(author_id: MemberId, content: impl Into<String>) -> StorageResult<Self> {
        let content = content.into();
        ensure!(
            !content.trim().is_empty(),
            ConflictSnafu {
                stage: "new-message-empty-content",
                entity: "message",
                details: "message content must not be empty".to_string(),
            }
        );

        Ok(Self {
            author_id,
            content,
            file_url: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_keys_parse_their_display_form() {
        let channel = ScopeKey::Channel(ChannelId::new_v7());
        let conversation = ScopeKey::Conversation(ConversationId::new_v7());

        assert_eq!(ScopeKey::parse(&channel.to_string()).unwrap(), channel);
        assert_eq!(
            conversation.to_string().parse::<ScopeKey>().unwrap(),
            conversation
        );
        assert_eq!(conversation.kind(), ScopeKind::Conversation);
    }

    #[test]
    fn scope_keys_reject_unknown_kinds() {
        let raw = format!("server:{}", ChannelId::new_v7());
        assert!(matches!(
            ScopeKey::parse(&raw),
            Err(StorageError::InvalidScopeKey { .. })
        ));
        assert!(ScopeKey::parse("channel").is_err());
    }

    #[test]
    fn message_records_use_transport_field_names() {
        let record = MessageRecord {
            id: MessageId::new_v7(),
            scope: ScopeKey::Channel(ChannelId::new_v7()),
            author_id: MemberId::new_v7(),
            content: "hello".to_string(),
            file_url: None,
            deleted: false,
            created_at_unix_millis: 1_700_000_000_000,
            updated_at_unix_millis: 1_700_000_000_000,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["scopeKey"], record.scope.to_string());
        assert_eq!(json["memberId"], record.author_id.to_string());
        assert_eq!(json["createdAt"], 1_700_000_000_000_u64);
    }
}
