use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SQLSTATE reported for a uniqueness violation.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE reported for a foreign key violation.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// SQLSTATE reported for a NOT NULL violation.
pub const NOT_NULL_VIOLATION: &str = "23502";
/// SQLSTATE reported when a query names a column the table does not have.
pub const UNDEFINED_COLUMN: &str = "42703";
/// Code reported when a single-row read matched more than one row.
pub const MULTIPLE_ROWS: &str = "PGRST116";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthenticated,
    NotFound,
    ConstraintViolation,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn not_authenticated() -> Self {
        Self::new(ErrorKind::NotAuthenticated, "Not authenticated")
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Maps a SQLSTATE-style code onto the error taxonomy.
    pub fn from_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let kind = if code.starts_with("23") {
            ErrorKind::ConstraintViolation
        } else {
            ErrorKind::Unknown
        };
        Self::new(kind, message).with_code(code)
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == ErrorKind::ConstraintViolation && self.code.as_deref() == Some(UNIQUE_VIOLATION)
    }
}
