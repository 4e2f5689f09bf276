//! Configuration structures for Tessera.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Largest frame the change-log serializer can describe with its u16 length.
pub const MAX_FRAME_BYTES: usize = u16::MAX as usize;

/// Size of the change-log frame header (length + transaction id).
pub const FRAME_HEADER_BYTES: usize = 6;

/// Width of the sender field in a multicast message header.
pub const SENDER_ID_BYTES: usize = 10;

/// Configuration for an in-process object database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum number of tables addressable by table id.
    pub max_tables: usize,
    /// Maximum change-log entries recorded within one transaction.
    pub log_entry_capacity: usize,
    /// Size of the pre-image side buffer in bytes.
    pub log_buffer_bytes: usize,
    /// Slots in a change feed ring (rounded up to a power of two).
    pub feed_capacity: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_tables: 256,
            log_entry_capacity: 65_536,
            log_buffer_bytes: 1024 * 1024, // 1 MB
            feed_capacity: 4096,
        }
    }
}

impl DatabaseConfig {
    /// Checks that every limit is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_tables == 0 || self.max_tables > 256 {
            return Err(TesseraError::InvalidParameter {
                name: "max_tables".to_string(),
                value: self.max_tables.to_string(),
            });
        }
        if self.log_entry_capacity == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "log_entry_capacity".to_string(),
                value: self.log_entry_capacity.to_string(),
            });
        }
        if self.feed_capacity == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "feed_capacity".to_string(),
                value: self.feed_capacity.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for the binary change-log serializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializerConfig {
    /// Frame buffer size in bytes; a frame is written when the next group would overflow it.
    pub buffer_bytes: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self { buffer_bytes: 1500 }
    }
}

impl SerializerConfig {
    /// Checks that the buffer fits the u16 frame length.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_bytes <= FRAME_HEADER_BYTES || self.buffer_bytes > MAX_FRAME_BYTES {
            return Err(TesseraError::InvalidParameter {
                name: "buffer_bytes".to_string(),
                value: self.buffer_bytes.to_string(),
            });
        }
        Ok(())
    }
}

/// Configuration for a reliable multicast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Messages retained per stream before the oldest must be flushed.
    pub stream_buffer_capacity: usize,
    /// Idle time after which a publisher multicasts a heartbeat.
    pub heartbeat_interval_micros: u64,
    /// Minimum spacing between repeated gap-fill requests for the same boundary.
    pub gapfill_retry_micros: u64,
    /// Contiguous sequences received between TRANSMITOK acknowledgments.
    pub ack_interval: u64,
    /// Readiness poll timeout; `None` blocks until a socket is readable.
    pub poll_timeout_micros: Option<u64>,
    /// Identifier written into the sender field of outgoing messages.
    pub sender_id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            stream_buffer_capacity: 100,
            heartbeat_interval_micros: 5_000_000, // 5 seconds
            gapfill_retry_micros: 1_000_000,      // 1 second
            ack_interval: 10,
            poll_timeout_micros: Some(1_000),
            sender_id: String::new(),
        }
    }
}

impl ChannelConfig {
    /// Checks buffer sizing, ack cadence and sender width.
    pub fn validate(&self) -> Result<()> {
        if self.stream_buffer_capacity == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "stream_buffer_capacity".to_string(),
                value: self.stream_buffer_capacity.to_string(),
            });
        }
        if self.ack_interval == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "ack_interval".to_string(),
                value: self.ack_interval.to_string(),
            });
        }
        if self.sender_id.len() > SENDER_ID_BYTES {
            return Err(TesseraError::ConfigError(format!(
                "sender_id longer than {} bytes",
                SENDER_ID_BYTES
            )));
        }
        Ok(())
    }
}
