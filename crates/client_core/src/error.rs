use shared::error::{BackendError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("{what} not found")]
    NotFound { what: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("malformed {what} row: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("message content must not be empty")]
    EmptyMessage,
}

impl ClientError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotAuthenticated => ErrorKind::NotAuthenticated,
            ClientError::NotFound { .. } => ErrorKind::NotFound,
            ClientError::Backend(err) => err.kind,
            ClientError::Decode { .. } | ClientError::EmptyMessage => ErrorKind::Unknown,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, ClientError::Backend(err) if err.is_unique_violation())
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
