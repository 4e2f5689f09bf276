//! Identifier types shared across Tessera crates.

/// Logical row identity within a table: `capacity * generation + slot`.
pub type RowId = u32;

/// Small integer addressing a table inside a database.
pub type TableId = u8;

/// Small integer addressing a database inside a registry.
pub type DbId = u8;

/// Field position inside a record's descriptor table.
pub type FieldId = u8;

/// Transaction counter, incremented on every non-empty commit.
pub type TxnId = u32;

/// Single-byte multicast stream identifier.
pub type StreamId = u8;

/// Position of a message within a multicast stream.
pub type Sequence = u64;

/// Handle to a transport connection (listener, stream or multicast socket).
pub type ConnId = u32;
