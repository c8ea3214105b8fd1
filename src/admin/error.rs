use std::path::PathBuf;

use crate::types::{ErrorKind, TaskError};
use thiserror::Error;

/// Failures of the administrative commands.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The storage directory holds no primary file and creation was not requested.
    #[error("no task store at {}", primary.display())]
    MissingStore {
        /// Primary file that was looked for.
        primary: PathBuf,
    },
    /// The storage directory path names something other than a directory.
    #[error("storage path {} is not a directory", path.display())]
    NotADirectory {
        /// Offending path.
        path: PathBuf,
    },
    /// Opening, recovering or operating on the store failed.
    #[error(transparent)]
    Store(#[from] TaskError),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;

impl AdminError {
    /// Error kind of the underlying store failure, if there was one.
    pub fn store_kind(&self) -> Option<ErrorKind> {
        match self {
            AdminError::Store(err) => Some(err.kind()),
            _ => None,
        }
    }
}
