//! Tessera common identifiers, errors and configuration.
//!
//! This crate provides shared definitions used across all Tessera components.

pub mod config;
pub mod error;
pub mod ids;

pub use config::{ChannelConfig, DatabaseConfig, SerializerConfig};
pub use error::{Result, TesseraError};
pub use ids::{ConnId, DbId, FieldId, RowId, Sequence, StreamId, TableId, TxnId};
