use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StitchError {
    #[error("fleet discovery failed: {0}")]
    Discovery(String),

    #[error("dispatch to {worker} failed: {reason}")]
    Dispatch { worker: String, reason: String },

    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    #[error("work catalog error: {0}")]
    Catalog(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StitchError>;
