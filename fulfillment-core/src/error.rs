//! Error types for the fulfillment core

use thiserror::Error;

/// Result type for fulfillment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fulfillment errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requisition not found
    #[error("Requisition not found: {0}")]
    RequisitionNotFound(String),

    /// Delivery not found
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    /// Project not found
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// Profile not found
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Institute not found
    #[error("Institute not found: {0}")]
    InstituteNotFound(String),

    /// Department not found
    #[error("Department not found: {0}")]
    DepartmentNotFound(String),

    /// Reconciliation refused to overwrite state it does not own
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Aggregation hit a delivery whose ownership chain is broken
    #[error("Incomplete record: {0}")]
    IncompleteRecord(String),

    /// Storage error (store unavailable, RocksDB failure)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (writer mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the not-found family of errors
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RequisitionNotFound(_)
                | Error::DeliveryNotFound(_)
                | Error::ProjectNotFound(_)
                | Error::ProfileNotFound(_)
                | Error::InstituteNotFound(_)
                | Error::DepartmentNotFound(_)
        )
    }

    /// True when retrying the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Conflict(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
