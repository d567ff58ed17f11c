use chrono::{DateTime, Utc};
use thiserror::Error;

use itinera_core::errors::{DirectoryError, StoreError};

pub mod directory;
pub mod instance;
pub mod workflow;

pub use directory::SqlDirectory;
pub use instance::SqlInstanceStore;
pub use workflow::SqlWorkflowStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for StoreError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => StoreError::Backend(error.to_string()),
            RepositoryError::Decode(message) => StoreError::Decode(message),
        }
    }
}

impl From<RepositoryError> for DirectoryError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => DirectoryError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => DirectoryError::Malformed(message),
        }
    }
}

pub(crate) fn decode_error(error: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}
