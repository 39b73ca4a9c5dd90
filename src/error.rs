use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::model::NoteId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Network(String),

    #[error("note {0} not found")]
    NotFound(NoteId),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    NetworkFailure,
    NotFound,
    Unauthorized,
    ValidationFailure,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) => ErrorKind::NetworkFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Validation(_) => ErrorKind::ValidationFailure,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Network(format!("database error: {err}"))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Network(format!("store task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_in_kebab_case() {
        let err = StoreError::NotFound(NoteId::from("abc"));
        assert_eq!(err.kind().to_string(), "not-found");
        let name: &'static str = StoreError::network("down").kind().into();
        assert_eq!(name, "network-failure");
    }

    #[test]
    fn only_network_failures_are_transient() {
        assert!(StoreError::network("timeout").is_transient());
        assert!(!StoreError::validation("too long").is_transient());
        assert!(!StoreError::Unauthorized("other owner".into()).is_transient());
    }
}
