//! Change-log frame layout constants.

/// Size of the frame header in bytes (u16 length + u32 transaction id).
pub const FRAME_HEADER_SIZE: usize = tessera_common::config::FRAME_HEADER_BYTES;

/// Largest frame the u16 length field can describe.
pub const MAX_FRAME_SIZE: usize = tessera_common::config::MAX_FRAME_BYTES;

/// Size of a group header in bytes (u8 table + u8 field code + u32 row).
pub const GROUP_HEADER_SIZE: usize = 6;
