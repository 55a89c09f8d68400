use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend error ({status}): {message}")]
    Backend {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{description} timed out after {after_ms}ms")]
    Timeout { description: String, after_ms: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Authentication required")]
    Unauthenticated,

    #[error("No family uses invite code {0}")]
    InvalidInviteCode(String),

    #[error("Invite code {0} is already taken")]
    DuplicateInviteCode(String),

    #[error("Rejected by row-level policy: {0}")]
    PolicyRejected(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout { .. })
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(_) | AppError::Timeout { .. } => true,
            AppError::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
