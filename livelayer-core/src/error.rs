//! Error types and result types for document store operations.
//!
//! Every fallible operation in the crate returns [`DocumentStoreResult<T>`]. The variants
//! follow the phase in which a failure is detected: selectors, sort specifications and
//! modifiers fail at [`Compile`](DocumentStoreError::Compile) time before any document is
//! touched, while comparisons and modifier application fail per document.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a document store.
///
/// The enum is `Clone` so a single failed recompute can be delivered to every listener
/// of an observed cursor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentStoreError {
    /// A selector, sort specification or modifier is malformed.
    #[error("Compile error: {0}")]
    Compile(String),
    /// Matching or sorting a specific document failed (unsortable values, parallel arrays,
    /// missing geo distances).
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    /// Applying a modifier to a specific document failed. The document is left untouched.
    #[error("Modifier error: {0}")]
    Modifier(String),
    /// A cursor was reconfigured while one of its executions was outstanding.
    #[error("cursor is executing, cursor is immutable!")]
    CursorExecuting,
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// The document violates the shape an operation requires.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
    /// An operation that needs an async runtime was used outside of one.
    #[error("Runtime error: {0}")]
    Runtime(String),
    /// A pending observable update was cancelled before it ran.
    #[error("Update cancelled")]
    Cancelled,
}

/// A specialized `Result` type for document store operations.
///
/// This type alias is used throughout the crate to indicate operations that may fail
/// with a [`DocumentStoreError`].
pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

impl DocumentStoreError {
    pub(crate) fn compile(msg: impl Into<String>) -> Self {
        DocumentStoreError::Compile(msg.into())
    }

    pub(crate) fn evaluation(msg: impl Into<String>) -> Self {
        DocumentStoreError::Evaluation(msg.into())
    }

    pub(crate) fn modifier(msg: impl Into<String>) -> Self {
        DocumentStoreError::Modifier(msg.into())
    }
}

impl From<BsonError> for DocumentStoreError {
    fn from(err: BsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for DocumentStoreError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentStoreError::Serialization(err.to_string())
    }
}
