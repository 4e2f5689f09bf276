//! Error types for Tessera.
//!
//! Capacity exhaustion and identity mismatches are reported through
//! `Option`/`bool` returns by the storage and channel APIs. The variants
//! here cover I/O, malformed external input and setup failures.

use thiserror::Error;

/// Result type alias using TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur in Tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Change-log errors
    #[error("Log frame corrupted at offset {offset}: {reason}")]
    FrameCorrupted { offset: u64, reason: String },

    #[error("Log frame truncated: expected {expected} bytes, got {actual}")]
    FrameTruncated { expected: usize, actual: usize },

    #[error("Unknown table id: {0}")]
    UnknownTable(u8),

    // Record errors
    #[error("Field not found: {table}.{field}")]
    FieldNotFound { table: String, field: String },

    #[error("Invalid field value for {field}: {value}")]
    InvalidFieldValue { field: String, value: String },

    #[error("Malformed text row: {0}")]
    MalformedRow(String),

    // Multicast errors
    #[error("Invalid message header: {0}")]
    InvalidHeader(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Connection {0} not found")]
    ConnectionNotFound(u32),

    #[error("Address error: {0}")]
    Address(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
