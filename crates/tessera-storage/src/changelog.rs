//! Per-transaction change log.
//!
//! Every insert, delete and field update made through a table writer
//! appends a [`LogEntry`]. Deletes and updates also copy the record's
//! pre-image (the whole record, or the field's old bytes) into a bounded
//! side buffer so the transaction can be rolled back. A write that does not
//! fit is dropped and reported with `false`; the mutation itself proceeds.

use bytes::{Bytes, BytesMut};
use tessera_buffer::SequencedBuffer;
use tessera_common::{DbId, FieldId, RowId, TableId};
use tracing::warn;

/// Field code used on the wire for a delete.
pub const DELETE_CODE: u8 = 255;

/// Field code used on the wire for an insert.
pub const INSERT_CODE: u8 = 254;

/// What a log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeKind {
    #[default]
    Insert,
    Delete,
    Update(FieldId),
}

impl ChangeKind {
    /// Wire code: 254 insert, 255 delete, otherwise the field id.
    pub fn code(&self) -> u8 {
        match self {
            ChangeKind::Insert => INSERT_CODE,
            ChangeKind::Delete => DELETE_CODE,
            ChangeKind::Update(field) => *field,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            INSERT_CODE => ChangeKind::Insert,
            DELETE_CODE => ChangeKind::Delete,
            field => ChangeKind::Update(field),
        }
    }
}

/// One recorded change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub checkpoint: u8,
    pub db_id: DbId,
    pub table: TableId,
    pub kind: ChangeKind,
    pub row: RowId,
    /// Pre-image location in the side buffer.
    image_offset: usize,
    image_len: usize,
}

/// Change log for the open transaction of one database.
pub struct ChangeLog {
    entries: SequencedBuffer<LogEntry>,
    images: BytesMut,
    max_image_bytes: usize,
    checkpoint: u8,
    /// Log writes refused since creation.
    dropped: u64,
}

impl ChangeLog {
    pub fn new(max_entries: usize, max_image_bytes: usize) -> Self {
        Self {
            entries: SequencedBuffer::new(max_entries),
            images: BytesMut::with_capacity(max_image_bytes),
            max_image_bytes,
            checkpoint: 0,
            dropped: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes left in the side buffer.
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.max_image_bytes - self.images.len()
    }

    /// Number of log writes refused for lack of room.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn checkpoint(&self) -> u8 {
        self.checkpoint
    }

    /// Starts a new checkpoint and returns its number.
    ///
    /// Checkpoint numbers are a `u8` and never wrap: once 255 is reached
    /// no further checkpoint is started and `None` is returned until the
    /// log is reset.
    pub fn add_checkpoint(&mut self) -> Option<u8> {
        let Some(next) = self.checkpoint.checked_add(1) else {
            warn!(checkpoint = self.checkpoint, "checkpoint limit reached");
            return None;
        };
        self.checkpoint = next;
        Some(next)
    }

    pub fn log_insert(&mut self, db_id: DbId, table: TableId, row: RowId) -> bool {
        self.append(db_id, table, ChangeKind::Insert, row, &[])
    }

    /// Records a delete along with the full record image.
    pub fn log_delete(&mut self, db_id: DbId, table: TableId, row: RowId, image: &[u8]) -> bool {
        self.append(db_id, table, ChangeKind::Delete, row, image)
    }

    /// Records a field update along with the field's previous bytes.
    pub fn log_update(
        &mut self,
        db_id: DbId,
        table: TableId,
        row: RowId,
        field: FieldId,
        image: &[u8],
    ) -> bool {
        self.append(db_id, table, ChangeKind::Update(field), row, image)
    }

    fn append(
        &mut self,
        db_id: DbId,
        table: TableId,
        kind: ChangeKind,
        row: RowId,
        image: &[u8],
    ) -> bool {
        if self.entries.is_full() || image.len() > self.free_bytes() {
            self.dropped += 1;
            warn!(
                table,
                row,
                code = kind.code(),
                entries = self.entries.len(),
                free_bytes = self.free_bytes(),
                "change log full, entry dropped"
            );
            return false;
        }
        let entry = LogEntry {
            checkpoint: self.checkpoint,
            db_id,
            table,
            kind,
            row,
            image_offset: self.images.len(),
            image_len: image.len(),
        };
        self.images.extend_from_slice(image);
        self.entries.insert(entry).is_some()
    }

    /// Entries in the order they were logged.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> + '_ {
        self.entries.iter().map(|(_, entry)| entry)
    }

    /// Pre-image bytes stored for an entry.
    pub fn image(&self, entry: &LogEntry) -> &[u8] {
        &self.images[entry.image_offset..entry.image_offset + entry.image_len]
    }

    /// Removes and returns, newest first, every entry logged at or after
    /// `checkpoint`, together with its pre-image.
    pub fn take_since(&mut self, checkpoint: u8) -> Vec<(LogEntry, Bytes)> {
        let mut undone = Vec::new();
        while let Some(entry) = self.entries.last().copied() {
            if entry.checkpoint < checkpoint {
                break;
            }
            self.entries.pop_last();
            let image = self.images.split_off(entry.image_offset).freeze();
            undone.push((entry, image));
        }
        if checkpoint <= self.checkpoint {
            self.checkpoint = checkpoint.saturating_sub(1);
        }
        undone
    }

    /// Clears entries and images and restarts checkpoint numbering.
    pub fn reset(&mut self) {
        self.entries.reset();
        self.images.clear();
        self.checkpoint = 0;
    }
}
