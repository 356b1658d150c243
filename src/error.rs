use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionStoreError),

    #[error("Turn error: {0}")]
    Turn(#[from] crate::turn::TurnError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
