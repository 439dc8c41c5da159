use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuckError>;

#[derive(Debug, Error)]
pub enum RuckError {
    #[error("object not found: {0}")]
    NotExist(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("pack {0} is listed by multiple indexes with conflicting entries; rebuild the index")]
    DuplicatePacks(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("HTTP {status} {phrase}")]
    Transport { status: u16, phrase: String },

    #[error("cannot determine size of streaming upload body")]
    UnknownSize,

    #[error("repository config already exists")]
    ConfigExists,

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl RuckError {
    /// Build a transport error from an HTTP status line.
    pub fn http(status: u16, phrase: impl Into<String>) -> Self {
        RuckError::Transport {
            status,
            phrase: phrase.into(),
        }
    }

    /// Whether this error means "the object is absent", either as a typed
    /// `NotExist` or as a raw HTTP 404 from a backend.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, RuckError::NotExist(_))
            || matches!(self, RuckError::Transport { status: 404, .. })
    }

    /// Whether an outer retry wrapper may retry this error. The core itself
    /// never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuckError::Transport { status, .. } => *status == 429 || *status >= 500,
            RuckError::Io(_) => true,
            _ => false,
        }
    }
}
