use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Inbound event rejected at ingestion; never reaches routing.
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("translation unavailable: {0}")]
    TranslationUnavailable(String),

    #[error("bot reply unavailable: {0}")]
    BotUnavailable(String),

    /// A collaborator answered with a non-success status.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn translation(message: impl Into<String>) -> Self {
        Self::TranslationUnavailable(message.into())
    }

    #[must_use]
    pub fn bot(message: impl Into<String>) -> Self {
        Self::BotUnavailable(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
