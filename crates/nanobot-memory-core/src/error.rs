use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory config error: {0}")]
    Config(String),

    #[error("memory backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("migration failed for {key}: {reason}")]
    MigrationFailure { key: String, reason: String },

    #[error("local store error: {0}")]
    LocalStore(String),
}

impl MemoryError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable(reason.into())
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

impl From<reqwest::Error> for MemoryError {
    fn from(error: reqwest::Error) -> Self {
        Self::BackendUnavailable(error.to_string())
    }
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;
