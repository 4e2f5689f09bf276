//! Object storage engine for Tessera.
//!
//! This crate provides:
//! - Field values and per-record descriptor tables
//! - Fixed-capacity slabs with stable, generation-stamped row ids
//! - Ordered secondary indices kept consistent with every mutation
//! - Per-transaction change logging with checkpoints and rollback
//! - Databases, a registry for addressing them by id, and change listeners
//! - A text dump/reload format for rows

pub mod changelog;
pub mod database;
pub mod feed;
pub mod field;
pub mod index;
pub mod record;
pub mod registry;
pub mod slab;
pub mod table;
pub mod text;

// Re-exported for `define_record!` expansions in downstream crates.
pub use bytes;

pub use changelog::{ChangeKind, ChangeLog, LogEntry, DELETE_CODE, INSERT_CODE};
pub use database::{ChangeListener, Database, SharedListener};
pub use feed::{ChangeEvent, ChangeFeed, FeedKind};
pub use field::{compare_key, FieldValue, FixedString, KeyMatch, Timestamp};
pub use index::{Index, IndexRange, IndexSet};
pub use record::{Comparator, FieldDescriptor, IndexDef, Record, PRIMARY_KEY};
pub use registry::DatabaseRegistry;
pub use slab::ObjectSlab;
pub use table::{AnyTable, Table, TableWriter};
pub use text::TextRow;
pub use tessera_common::{DbId, FieldId, RowId, TableId, TxnId};
