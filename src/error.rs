//! Top-level error types for convo.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True when the model side failed or was stopped before completing.
    pub fn is_generation_failure(&self) -> bool {
        matches!(self, Error::Llm(_))
    }

    /// True when a finished exchange could not be made durable.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(self, Error::Memory(MemoryError::PersistenceFailed { .. }))
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Database connection errors.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to connect to SQLite: {0}")]
    SqliteConnect(#[from] sqlx::Error),

    #[error("schema setup failed: {0}")]
    Schema(String),
}

/// Model provider and generation errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("generation cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("no fragment received within {after:?}")]
    TimedOut { after: std::time::Duration },

    #[error("no API key configured for the model provider")]
    MissingApiKey,
}

/// Conversation memory errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("conversation id cannot be empty")]
    InvalidConversationId,

    #[error("message text cannot be empty")]
    EmptyMessage,

    #[error("failed to persist conversation {conversation_id}: {reason}")]
    PersistenceFailed {
        conversation_id: String,
        reason: String,
    },

    #[error("unknown message role in storage: {0}")]
    UnknownRole(String),

    #[error("corrupt stored message: {0}")]
    CorruptRow(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
