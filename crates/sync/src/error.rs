use parley_storage::{ScopeKey, StorageError};
use snafu::Snafu;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("page fetch for {scope} failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        scope: ScopeKey,
        source: BoxedError,
    },
    #[snafu(display("cannot open conversation {scope} on `{stage}`: {reason}"))]
    Scope {
        stage: &'static str,
        scope: ScopeKey,
        reason: String,
    },
    #[snafu(display("scope {scope} is already open in this session"))]
    ScopeAlreadyOpen { stage: &'static str, scope: ScopeKey },
}

impl SyncError {
    /// Maps a storage failure onto the sync taxonomy: unknown scopes are fatal, the rest retryable.
    pub fn from_storage(stage: &'static str, scope: ScopeKey, error: StorageError) -> Self {
        if error.is_unknown_scope() {
            Self::Scope {
                stage,
                scope,
                reason: error.to_string(),
            }
        } else {
            Self::Transport {
                stage,
                scope,
                source: Box::new(error),
            }
        }
    }

    /// Returns true when the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn scope(&self) -> ScopeKey {
        match self {
            Self::Transport { scope, .. }
            | Self::Scope { scope, .. }
            | Self::ScopeAlreadyOpen { scope, .. } => *scope,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
