use thiserror::Error;

pub type AdServeResult<T> = Result<T, AdServeError>;

#[derive(Error, Debug)]
pub enum AdServeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache tier unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AdServeError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Self::InvalidInput(what.into())
    }

    /// True for failures of shared infrastructure rather than of the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::CacheUnavailable(_) | Self::Internal(_)
        )
    }
}
