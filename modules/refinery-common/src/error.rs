use thiserror::Error;

pub type Result<T> = std::result::Result<T, RefineryError>;

#[derive(Error, Debug)]
pub enum RefineryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<sqlx::Error> for RefineryError {
    fn from(e: sqlx::Error) -> Self {
        RefineryError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for RefineryError {
    fn from(e: serde_json::Error) -> Self {
        RefineryError::Validation(e.to_string())
    }
}
