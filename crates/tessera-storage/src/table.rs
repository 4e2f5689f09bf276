//! Tables: a slab of records kept consistent with its indices.
//!
//! Reads go through [`Table`] directly. Mutations go through a
//! [`TableWriter`], which pairs the table with its database's change log so
//! every insert, update and delete is recorded.

use crate::changelog::{ChangeKind, ChangeLog, LogEntry};
use crate::index::{IndexRange, IndexSet};
use crate::record::{Record, PRIMARY_KEY};
use crate::slab::ObjectSlab;
use crate::text::{self, TextRow};
use bytes::BytesMut;
use std::any::Any;
use tessera_common::{DbId, FieldId, Result, RowId, TableId, TesseraError};
use tracing::warn;

/// Storage and indices for one record type.
pub struct Table<R: Record> {
    id: TableId,
    db_id: DbId,
    slab: ObjectSlab<R>,
    indices: IndexSet<R>,
}

impl<R: Record> Table<R> {
    /// Creates a table with room for `capacity` live records.
    pub fn new(id: TableId, db_id: DbId, capacity: usize) -> Self {
        let mut slab = ObjectSlab::new(R::is_entity());
        slab.setup(capacity);
        Self {
            id,
            db_id,
            slab,
            indices: IndexSet::from_record(),
        }
    }

    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[inline]
    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        R::TABLE_NAME
    }

    /// Number of live records.
    #[inline]
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.slab.generation()
    }

    #[inline]
    pub fn is_entity(&self) -> bool {
        self.slab.is_entity()
    }

    /// Slots available for new records.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.slab.free_len()
    }

    /// Physical slot that backs `row`.
    pub fn slot_of(&self, row: RowId) -> Option<usize> {
        self.slab.slot_of(row)
    }

    /// Returns the live record with this logical id.
    pub fn get(&self, row: RowId) -> Option<&R> {
        self.slab.get(row)
    }

    /// Iterates live records in slot order.
    pub fn records(&self) -> impl Iterator<Item = &R> + '_ {
        self.slab.iter().map(|(_, r)| r)
    }

    /// Size of a named index.
    pub fn index_len(&self, name: &str) -> Option<usize> {
        self.indices.get(name).map(|i| i.len())
    }

    /// Finds the record matching `key` in a unique index.
    ///
    /// Only field values take part; the key's own identity is ignored.
    pub fn find_unique(&self, name: &str, key: &R) -> Option<&R> {
        let index = self.indices.get(name)?;
        let lo = index.lower_bound(&self.slab, key);
        let hi = index.upper_bound(&self.slab, key);
        if lo == hi {
            return None;
        }
        index.slots(lo, hi).first().and_then(|&s| self.slab.at(s))
    }

    pub fn find_by_primary_key(&self, key: &R) -> Option<&R> {
        self.find_unique(PRIMARY_KEY, key)
    }

    /// Iterates a half-open index range.
    ///
    /// `lower` starts at the first record not less than it; `upper` stops
    /// after the last record not greater than it. Either bound may be
    /// omitted. Returns `None` for an unknown index.
    pub fn range(&self, name: &str, lower: Option<&R>, upper: Option<&R>) -> Option<IndexRange<'_, R>> {
        let index = self.indices.get(name)?;
        let lo = lower.map_or(0, |k| index.lower_bound(&self.slab, k));
        let hi = upper.map_or(index.len(), |k| index.upper_bound(&self.slab, k));
        Some(IndexRange::new(&self.slab, index.slots(lo, hi)))
    }

    /// Iterates a whole index in order.
    pub fn iter(&self, name: &str) -> Option<IndexRange<'_, R>> {
        self.range(name, None, None)
    }

    /// Text of an entity row's permanent key, its first field.
    ///
    /// Returns `None` for a non-entity table or a row that is not live.
    pub fn perm_key(&self, row: RowId) -> Option<String> {
        if !self.is_entity() {
            return None;
        }
        let first = R::fields().first()?;
        self.get(row).map(|record| (first.to_text)(record))
    }

    /// Finds an entity record by the text of its permanent key.
    pub fn lookup_perm_key(&self, key: &str) -> Option<&R> {
        if !self.is_entity() || key.is_empty() {
            return None;
        }
        let first = R::fields().first()?;
        let mut wanted = R::default();
        (first.from_text)(&mut wanted, key)?;
        self.find_by_primary_key(&wanted)
    }

    /// Row id of the entity record with this permanent key.
    pub fn fast_index(&self, key: &str) -> Option<RowId> {
        self.lookup_perm_key(key)?.row()
    }

    /// Returns true if every index holds exactly one entry per live record.
    pub fn check_indices(&self) -> bool {
        let bad = self.indices.inconsistent(self.len());
        for name in &bad {
            warn!(
                table = R::TABLE_NAME,
                index = name,
                size = self.len(),
                "index size differs from table size"
            );
        }
        bad.is_empty()
    }

    // Unlogged primitives

    fn insert_record(&mut self, mut record: R, requested: Option<RowId>) -> Option<RowId> {
        let (slot, row) = self.slab.allocate(requested)?;
        record.set_row(Some(row));
        record.set_db_id(self.db_id);
        self.slab.place(slot, record);
        self.indices.insert_all(&self.slab, slot);
        Some(row)
    }

    fn remove_record(&mut self, row: RowId) -> Option<R> {
        self.slab.get(row)?;
        let slot = self.slab.slot_of(row)?;
        self.indices.remove_all(&self.slab, slot);
        self.slab.release(row)
    }

    /// Applies `mutate`, re-indexing around it when an indexed field may change.
    fn modify_record(&mut self, row: RowId, field: Option<FieldId>, mutate: impl FnOnce(&mut R)) -> bool {
        let Some(slot) = self.slab.get(row).and_then(|_| self.slab.slot_of(row)) else {
            return false;
        };
        let reindex = match field {
            Some(f) => R::fields().get(f as usize).map_or(false, |d| d.indexed),
            None => true,
        };
        if reindex {
            self.indices.remove_all(&self.slab, slot);
        }
        if let Some(record) = self.slab.get_mut(row) {
            let row_id = record.row();
            let db_id = record.db_id();
            mutate(record);
            record.set_row(row_id);
            record.set_db_id(db_id);
        }
        if reindex {
            self.indices.insert_all(&self.slab, slot);
        }
        true
    }

    fn restore_record(&mut self, record: R) -> bool {
        let Some(slot) = record.row().and_then(|row| self.slab.slot_of(row)) else {
            return false;
        };
        if !self.slab.restore(record) {
            return false;
        }
        self.indices.insert_all(&self.slab, slot);
        true
    }

    // Logged operations

    fn create_logged(&mut self, log: &mut ChangeLog, template: R, requested: Option<RowId>) -> Option<RowId> {
        let row = self.insert_record(template, requested)?;
        log.log_insert(self.db_id, self.id, row);
        Some(row)
    }

    fn remove_logged(&mut self, log: &mut ChangeLog, row: RowId) -> bool {
        let Some(record) = self.slab.get(row) else {
            return false;
        };
        let mut image = BytesMut::with_capacity(R::record_width());
        record.encode_fields(&mut image);
        log.log_delete(self.db_id, self.id, row, &image);
        self.remove_record(row).is_some()
    }

    fn update_logged(
        &mut self,
        log: &mut ChangeLog,
        row: RowId,
        field: FieldId,
        mutate: impl FnOnce(&mut R),
    ) -> bool {
        let Some(record) = self.slab.get(row) else {
            return false;
        };
        let mut image = BytesMut::new();
        if !record.encode_field(field, &mut image) {
            return false;
        }
        log.log_update(self.db_id, self.id, row, field, &image);
        self.modify_record(row, Some(field), mutate)
    }

    fn remove_all_logged(&mut self, log: &mut ChangeLog) -> usize {
        let rows: Vec<RowId> = self.records().filter_map(|r| r.row()).collect();
        self.remove_rows_logged(log, rows)
    }

    fn remove_rows_logged(&mut self, log: &mut ChangeLog, rows: Vec<RowId>) -> usize {
        rows.into_iter().filter(|&row| self.remove_logged(log, row)).count()
    }
}

/// Mutable access to a table that records every change.
pub struct TableWriter<'a, R: Record> {
    table: &'a mut Table<R>,
    log: &'a mut ChangeLog,
}

impl<'a, R: Record> TableWriter<'a, R> {
    pub(crate) fn new(table: &'a mut Table<R>, log: &'a mut ChangeLog) -> Self {
        Self { table, log }
    }

    /// Read access to the underlying table.
    pub fn table(&self) -> &Table<R> {
        self.table
    }

    pub fn get(&self, row: RowId) -> Option<&R> {
        self.table.get(row)
    }

    /// Creates a default record. Returns `None` when the table is full.
    pub fn create(&mut self) -> Option<RowId> {
        self.table.create_logged(self.log, R::default(), None)
    }

    /// Creates a default record at exactly `row`, if that row's slot is free.
    pub fn create_with_id(&mut self, row: RowId) -> Option<RowId> {
        self.table.create_logged(self.log, R::default(), Some(row))
    }

    /// Creates a record with the template's field values.
    ///
    /// A template that carries a row id requests that exact row.
    pub fn copy_object(&mut self, template: &R) -> Option<RowId> {
        self.table
            .create_logged(self.log, template.clone(), template.row())
    }

    /// Deletes a record. Returns false if no live record has that id.
    pub fn remove(&mut self, row: RowId) -> bool {
        self.table.remove_logged(self.log, row)
    }

    /// Changes one field through `mutate`, re-indexing if the field is indexed.
    ///
    /// `mutate` must only touch the named field: the change log records that
    /// field alone.
    pub fn update(&mut self, row: RowId, field: FieldId, mutate: impl FnOnce(&mut R)) -> bool {
        self.table.update_logged(self.log, row, field, mutate)
    }

    /// Sets a field from text. Returns `Ok(false)` if the row is not live.
    pub fn set_text(&mut self, row: RowId, name: &str, value: &str) -> Result<bool> {
        let Some(current) = self.table.get(row) else {
            return Ok(false);
        };
        let field = R::field_index(name).ok_or_else(|| TesseraError::FieldNotFound {
            table: R::TABLE_NAME.to_string(),
            field: name.to_string(),
        })?;
        let mut staged = current.clone();
        staged.set(name, value)?;
        Ok(self.update(row, field, move |r| r.copy_fields_from(&staged)))
    }

    /// Returns the record matching `key` in `index`, creating it from the key if absent.
    pub fn lookup_or_create(&mut self, key: &R, index: &str) -> Option<RowId> {
        if let Some(found) = self.table.find_unique(index, key) {
            return found.row();
        }
        let mut template = key.clone();
        template.set_row(None);
        self.copy_object(&template)
    }

    /// Deletes every record in an index range, bounds as for [`Table::range`].
    ///
    /// Rows are collected before any is removed, so the range is not
    /// disturbed while it is walked. Generations and retired slots are kept.
    /// Returns the number deleted, or `None` for an unknown index.
    pub fn delete_all(&mut self, index: &str, lower: Option<&R>, upper: Option<&R>) -> Option<usize> {
        let rows: Vec<RowId> = self
            .table
            .range(index, lower, upper)?
            .filter_map(|r| r.row())
            .collect();
        Some(self.table.remove_rows_logged(self.log, rows))
    }

    /// Deletes every record and reinitialises the free list and generation.
    pub fn reset(&mut self) {
        self.table.remove_all_logged(self.log);
        self.table.slab.reset();
        self.table.indices.clear();
    }
}

/// Type-erased table operations used by the database, replay and text paths.
pub trait AnyTable: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn is_entity(&self) -> bool;
    fn contains(&self, row: RowId) -> bool;

    /// Width of one field, or of the whole record for `None`.
    fn field_width(&self, field: Option<FieldId>) -> Option<usize>;

    /// Appends a row's bytes (one field, or every field for `None`).
    fn encode_row(&self, row: RowId, field: Option<FieldId>, buf: &mut BytesMut) -> bool;

    /// Writes a row from bytes: an upsert for `None`, a field update otherwise.
    fn apply_row(&mut self, log: &mut ChangeLog, row: RowId, field: Option<FieldId>, bytes: &[u8]) -> Result<bool>;

    fn delete_row(&mut self, log: &mut ChangeLog, row: RowId) -> bool;

    /// Reverts one log entry without logging.
    fn undo(&mut self, entry: &LogEntry, image: &[u8]) -> bool;

    fn row_text(&self, row: RowId) -> Option<String>;

    /// Re-creates a row from a parsed text line.
    fn load_text(&mut self, log: &mut ChangeLog, text: &TextRow) -> Result<bool>;

    /// Row ids in primary-key order.
    fn primary_rows(&self) -> Vec<RowId>;

    fn check_indices(&self) -> bool;
}

impl<R: Record> AnyTable for Table<R> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn name(&self) -> &'static str {
        R::TABLE_NAME
    }

    fn len(&self) -> usize {
        Table::len(self)
    }

    fn capacity(&self) -> usize {
        Table::capacity(self)
    }

    fn is_entity(&self) -> bool {
        Table::is_entity(self)
    }

    fn contains(&self, row: RowId) -> bool {
        self.get(row).is_some()
    }

    fn field_width(&self, field: Option<FieldId>) -> Option<usize> {
        match field {
            Some(f) => R::field_width(f),
            None => Some(R::record_width()),
        }
    }

    fn encode_row(&self, row: RowId, field: Option<FieldId>, buf: &mut BytesMut) -> bool {
        let Some(record) = self.get(row) else {
            return false;
        };
        match field {
            Some(f) => record.encode_field(f, buf),
            None => {
                record.encode_fields(buf);
                true
            }
        }
    }

    fn apply_row(&mut self, log: &mut ChangeLog, row: RowId, field: Option<FieldId>, bytes: &[u8]) -> Result<bool> {
        match (field, self.get(row).cloned()) {
            (None, None) => {
                let mut template = R::default();
                template.decode_fields(bytes)?;
                Ok(self.create_logged(log, template, Some(row)).is_some())
            }
            (None, Some(current)) => {
                let mut incoming = current.clone();
                incoming.decode_fields(bytes)?;
                let count = R::fields().len();
                // One logged update per field, each touching only its own field.
                for f in 0..count {
                    let Ok(f) = FieldId::try_from(f) else { break };
                    let mut value = BytesMut::with_capacity(R::field_width(f).unwrap_or(0));
                    incoming.encode_field(f, &mut value);
                    self.update_logged(log, row, f, move |r| {
                        let _ = r.decode_field(f, &value);
                    });
                }
                Ok(true)
            }
            (Some(f), Some(current)) => {
                let mut incoming = current;
                incoming.decode_field(f, bytes)?;
                Ok(self.update_logged(log, row, f, move |r| r.copy_fields_from(&incoming)))
            }
            (Some(_), None) => Ok(false),
        }
    }

    fn delete_row(&mut self, log: &mut ChangeLog, row: RowId) -> bool {
        self.remove_logged(log, row)
    }

    fn undo(&mut self, entry: &LogEntry, image: &[u8]) -> bool {
        match entry.kind {
            ChangeKind::Insert => self.remove_record(entry.row).is_some(),
            ChangeKind::Delete => {
                let mut record = R::default();
                if record.decode_fields(image).is_err() {
                    return false;
                }
                record.set_row(Some(entry.row));
                record.set_db_id(self.db_id);
                self.restore_record(record)
            }
            ChangeKind::Update(field) => {
                let Some(current) = self.get(entry.row) else {
                    return false;
                };
                let mut previous = current.clone();
                if previous.decode_field(field, image).is_err() {
                    return false;
                }
                self.modify_record(entry.row, Some(field), move |r| r.copy_fields_from(&previous))
            }
        }
    }

    fn row_text(&self, row: RowId) -> Option<String> {
        self.get(row).map(text::format_row)
    }

    fn load_text(&mut self, log: &mut ChangeLog, text: &TextRow) -> Result<bool> {
        let template: R = text::build_record(text)?;
        Ok(self.create_logged(log, template, text.row).is_some())
    }

    fn primary_rows(&self) -> Vec<RowId> {
        self.iter(PRIMARY_KEY)
            .map(|range| range.filter_map(|r| r.row()).collect())
            .unwrap_or_default()
    }

    fn check_indices(&self) -> bool {
        Table::check_indices(self)
    }
}
