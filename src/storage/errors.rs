//! Storage-specific error types.
//!
//! These errors describe failures of the relational store itself and carry no
//! knowledge of what a row means to the harness.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// A row cannot be stored or read back in the expected shape.
    InvalidData { message: String, cause: String },

    /// Invalid query parameters.
    InvalidQuery {
        message: String,
        attribute: Option<String>,
    },

    /// Storage backend is temporarily unavailable.
    Unavailable { message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidData { message, cause } => {
                write!(f, "Invalid data: {} (cause: {})", message, cause)
            }
            StorageError::InvalidQuery { message, attribute } => {
                if let Some(attr) = attribute {
                    write!(f, "Invalid query: {} (attribute: {})", message, attr)
                } else {
                    write!(f, "Invalid query: {}", message)
                }
            }
            StorageError::Unavailable { message } => {
                write!(f, "Storage unavailable: {}", message)
            }
        }
    }
}

impl std::error::Error for StorageError {}

impl StorageError {
    /// Create a new InvalidData error with the serializer's complaint as cause.
    pub fn invalid_data(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::InvalidData {
            message: message.into(),
            cause: cause.to_string(),
        }
    }

    /// Create a new InvalidQuery error naming the offending attribute.
    pub fn invalid_query(message: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
            attribute: Some(attribute.into()),
        }
    }

    /// Create a new Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Check if retrying the operation may succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}
