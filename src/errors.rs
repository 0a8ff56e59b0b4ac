//! Error types for the WAL replication endpoint
//! Structured error handling using thiserror for better error reporting

use thiserror::Error;

use crate::broker::BrokerError;

/// Main error type for the replication endpoint
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Row-key view construction outside the backing buffer
    #[error("Row key range out of bounds: offset {offset} length {length} backing {backing}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        backing: usize,
    },

    /// A typed value conversion failed for one column
    #[error("Decode error for column {table}.{qualifier} as {type_name}")]
    Decode {
        table: String,
        qualifier: String,
        type_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Payload serialization errors
    #[error("Payload serialization error")]
    Serialization(#[from] serde_json::Error),

    /// Broker producer/delivery errors surfaced through flushes
    #[error("Broker error")]
    Broker(#[from] BrokerError),

    /// Input that is skipped rather than failed (bad topic name, empty key)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

/// Result type alias for convenience
pub type EndpointResult<T> = std::result::Result<T, EndpointError>;

impl EndpointError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an out-of-bounds error for a row-key range
    pub fn out_of_bounds(offset: usize, length: usize, backing: usize) -> Self {
        Self::OutOfBounds {
            offset,
            length,
            backing,
        }
    }

    /// Create a decode error carrying the column coordinates and declared type
    pub fn decode<S, Q, T, E>(table: S, qualifier: Q, type_name: T, source: E) -> Self
    where
        S: Into<String>,
        Q: Into<String>,
        T: Into<String>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Decode {
            table: table.into(),
            qualifier: qualifier.into(),
            type_name: type_name.into(),
            source: source.into(),
        }
    }

    /// Create an invalid-input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}
