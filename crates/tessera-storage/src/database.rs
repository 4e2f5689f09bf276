//! In-process object database.
//!
//! A database owns up to `max_tables` tables addressed by a small id, one
//! change log for the open transaction and a list of listeners. All table
//! mutation happens on one thread; listeners may hand data to others.
//!
//! `commit` notifies listeners in a fixed order: every delete, then every
//! insert, then every field update, then a transaction notice carrying the
//! new transaction id.

use crate::changelog::{ChangeKind, ChangeLog, LogEntry};
use crate::record::{Record, PRIMARY_KEY};
use crate::table::{AnyTable, Table, TableWriter};
use crate::text;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use tessera_common::{DatabaseConfig, DbId, FieldId, Result, RowId, TableId, TesseraError, TxnId};
use tracing::{debug, warn};

/// Field ids at or above this value are reserved for insert and delete codes.
const MAX_FIELDS: usize = crate::changelog::INSERT_CODE as usize;

/// Receives committed changes.
///
/// Callbacks run on the committing thread while the database is borrowed;
/// listeners read row contents through the `&Database` they are handed.
pub trait ChangeListener: Send {
    fn on_row_add(&mut self, table: TableId, row: RowId, db: &Database);

    fn on_row_delete(&mut self, table: TableId, row: RowId);

    fn on_row_change(&mut self, table: TableId, row: RowId, field: FieldId, db: &Database);

    /// Closes a transaction. Called once per commit, after every row callback.
    fn next_transaction_notice(&mut self, txn: TxnId);
}

/// A listener shared between the database and its owner.
pub type SharedListener = Arc<Mutex<dyn ChangeListener>>;

/// Tables, change log and listeners for one database id.
pub struct Database {
    id: DbId,
    config: DatabaseConfig,
    tables: Vec<Option<Box<dyn AnyTable>>>,
    log: ChangeLog,
    listeners: Vec<SharedListener>,
    transaction_id: TxnId,
}

impl Database {
    /// Creates an empty database.
    pub fn new(id: DbId, config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let log = ChangeLog::new(config.log_entry_capacity, config.log_buffer_bytes);
        let tables = (0..config.max_tables).map(|_| None).collect();
        Ok(Self {
            id,
            config,
            tables,
            log,
            listeners: Vec::new(),
            transaction_id: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> DbId {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Id of the last committed transaction; zero before the first commit.
    #[inline]
    pub fn transaction_id(&self) -> TxnId {
        self.transaction_id
    }

    /// The open transaction's change log.
    #[inline]
    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    /// Creates a table for record type `R` under `table_id`.
    pub fn register_table<R: Record>(&mut self, table_id: TableId, capacity: usize) -> Result<()> {
        let slot = self
            .tables
            .get_mut(table_id as usize)
            .ok_or_else(|| TesseraError::InvalidParameter {
                name: "table_id".to_string(),
                value: table_id.to_string(),
            })?;
        if slot.is_some() {
            return Err(TesseraError::ConfigError(format!(
                "table id {} already registered",
                table_id
            )));
        }
        if capacity == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "capacity".to_string(),
                value: capacity.to_string(),
            });
        }
        if !R::indices().iter().any(|i| i.name == PRIMARY_KEY) {
            return Err(TesseraError::ConfigError(format!(
                "{} has no {} index",
                R::TABLE_NAME,
                PRIMARY_KEY
            )));
        }
        if R::fields().len() >= MAX_FIELDS {
            return Err(TesseraError::ConfigError(format!(
                "{} has {} fields, limit is {}",
                R::TABLE_NAME,
                R::fields().len(),
                MAX_FIELDS - 1
            )));
        }
        *slot = Some(Box::new(Table::<R>::new(table_id, self.id, capacity)));
        debug!(db = self.id, table_id, name = R::TABLE_NAME, capacity, "table registered");
        Ok(())
    }

    /// Typed read access to a table.
    pub fn table<R: Record>(&self, table_id: TableId) -> Option<&Table<R>> {
        self.erased(table_id)?.as_any().downcast_ref()
    }

    /// Typed write access to a table, coupled with the change log.
    pub fn writer<R: Record>(&mut self, table_id: TableId) -> Option<TableWriter<'_, R>> {
        let table = self
            .tables
            .get_mut(table_id as usize)?
            .as_mut()?
            .as_any_mut()
            .downcast_mut::<Table<R>>()?;
        Some(TableWriter::new(table, &mut self.log))
    }

    fn erased(&self, table_id: TableId) -> Option<&dyn AnyTable> {
        self.tables.get(table_id as usize)?.as_deref()
    }

    /// Looks up a table id by record table name.
    pub fn table_id(&self, name: &str) -> Option<TableId> {
        self.tables
            .iter()
            .position(|t| t.as_ref().map_or(false, |t| t.name() == name))
            .and_then(|i| TableId::try_from(i).ok())
    }

    /// Ids of every registered table, ascending.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .filter_map(|(i, _)| TableId::try_from(i).ok())
            .collect()
    }

    /// Subscribes a listener to future commits.
    pub fn add_listener(&mut self, listener: SharedListener) {
        self.listeners.push(listener);
    }

    /// Starts a new checkpoint within the open transaction, or returns
    /// `None` once the transaction already holds 255 of them.
    pub fn add_checkpoint(&mut self) -> Option<u8> {
        self.log.add_checkpoint()
    }

    /// Publishes the open transaction to every listener.
    ///
    /// Returns the new transaction id, or `None` if nothing was logged.
    pub fn commit(&mut self) -> Option<TxnId> {
        if self.log.is_empty() {
            self.log.reset();
            return None;
        }
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let txn = self.transaction_id;
        debug!(db = self.id, txn, entries = self.log.len(), "commit");

        let entries: Vec<LogEntry> = self.log.entries().copied().collect();
        for listener in &self.listeners {
            let mut listener = listener.lock();
            for entry in entries.iter().filter(|e| e.kind == ChangeKind::Delete) {
                listener.on_row_delete(entry.table, entry.row);
            }
            for entry in entries.iter().filter(|e| e.kind == ChangeKind::Insert) {
                listener.on_row_add(entry.table, entry.row, self);
            }
            for entry in &entries {
                if let ChangeKind::Update(field) = entry.kind {
                    listener.on_row_change(entry.table, entry.row, field, self);
                }
            }
            listener.next_transaction_notice(txn);
        }
        self.log.reset();
        Some(txn)
    }

    /// Undoes the whole open transaction. Returns the number of changes undone.
    pub fn rollback(&mut self) -> usize {
        let undone = self.rollback_to(0);
        self.log.reset();
        undone
    }

    /// Undoes every change logged at or after `checkpoint`, newest first.
    pub fn rollback_to(&mut self, checkpoint: u8) -> usize {
        let mut undone = 0;
        for (entry, image) in self.log.take_since(checkpoint) {
            let Some(table) = self
                .tables
                .get_mut(entry.table as usize)
                .and_then(Option::as_mut)
            else {
                continue;
            };
            if table.undo(&entry, &image) {
                undone += 1;
            } else {
                warn!(
                    db = self.id,
                    table = entry.table,
                    row = entry.row,
                    code = entry.kind.code(),
                    "change could not be undone"
                );
            }
        }
        debug!(db = self.id, checkpoint, undone, "rollback");
        undone
    }

    /// Appends a row's bytes: one field, or every field for `None`.
    pub fn row_bytes(&self, table_id: TableId, row: RowId, field: Option<FieldId>, buf: &mut BytesMut) -> bool {
        self.erased(table_id)
            .map_or(false, |t| t.encode_row(row, field, buf))
    }

    /// Byte width of a field, or of a whole record for `None`.
    pub fn field_width(&self, table_id: TableId, field: Option<FieldId>) -> Option<usize> {
        self.erased(table_id)?.field_width(field)
    }

    /// Returns true if the row is live.
    pub fn contains(&self, table_id: TableId, row: RowId) -> bool {
        self.erased(table_id).map_or(false, |t| t.contains(row))
    }

    /// Writes a row from bytes through the change log.
    ///
    /// With `field == None` the bytes are a whole record: an existing row is
    /// updated field by field, otherwise the row is created at exactly `row`.
    pub fn apply_row(&mut self, table_id: TableId, row: RowId, field: Option<FieldId>, bytes: &[u8]) -> Result<bool> {
        let table = self
            .tables
            .get_mut(table_id as usize)
            .and_then(Option::as_mut)
            .ok_or(TesseraError::UnknownTable(table_id))?;
        table.apply_row(&mut self.log, row, field, bytes)
    }

    /// Deletes a row through the change log.
    pub fn delete_row(&mut self, table_id: TableId, row: RowId) -> Result<bool> {
        let table = self
            .tables
            .get_mut(table_id as usize)
            .and_then(Option::as_mut)
            .ok_or(TesseraError::UnknownTable(table_id))?;
        Ok(table.delete_row(&mut self.log, row))
    }

    /// Renders one row as a text line.
    pub fn row_text(&self, table_id: TableId, row: RowId) -> Option<String> {
        self.erased(table_id)?.row_text(row)
    }

    /// Renders every row of a table in primary-key order.
    pub fn dump_text(&self, table_id: TableId) -> Result<Vec<String>> {
        let table = self
            .erased(table_id)
            .ok_or(TesseraError::UnknownTable(table_id))?;
        Ok(table
            .primary_rows()
            .into_iter()
            .filter_map(|row| table.row_text(row))
            .collect())
    }

    /// Re-creates a row from a text line, keeping its original row id.
    ///
    /// Returns `Ok(false)` if the row's slot is taken or the table is full.
    pub fn load_text(&mut self, line: &str) -> Result<bool> {
        let parsed = text::parse_row(line)?;
        let table_id = self
            .table_id(&parsed.table)
            .ok_or_else(|| TesseraError::MalformedRow(format!("unknown table {}", parsed.table)))?;
        let table = self
            .tables
            .get_mut(table_id as usize)
            .and_then(Option::as_mut)
            .ok_or(TesseraError::UnknownTable(table_id))?;
        table.load_text(&mut self.log, &parsed)
    }

    /// Returns true if every index of every table matches its table's size.
    pub fn check_indices(&self) -> bool {
        self.tables.iter().flatten().all(|t| t.check_indices())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{compare_key, KeyMatch};
    use std::cmp::Ordering;

    crate::define_record! {
        pub struct Fill = "Fill" {
            [ORDER = 0] index order: Option<u32>,
            [PRICE = 1] plain price: i64,
        }
        indices {
            "PrimaryKey" => Fill::by_order,
        }
    }

    crate::define_record! {
        pub struct Unkeyed = "Unkeyed" {
            [VALUE = 0] plain value: u8,
        }
        indices {
            "ByValue" => Unkeyed::by_nothing,
        }
    }

    impl Fill {
        fn by_order(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.order, &b.order, m)
        }

        fn new(order: u32, price: i64) -> Self {
            Fill {
                order: Some(order),
                price,
                ..Default::default()
            }
        }
    }

    impl Unkeyed {
        fn by_nothing(_: &Self, _: &Self, _: KeyMatch) -> Ordering {
            Ordering::Equal
        }
    }

    /// Records callbacks as strings.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl ChangeListener for Recorder {
        fn on_row_add(&mut self, table: TableId, row: RowId, db: &Database) {
            assert!(db.contains(table, row));
            self.calls.push(format!("add {table}/{row}"));
        }

        fn on_row_delete(&mut self, table: TableId, row: RowId) {
            self.calls.push(format!("delete {table}/{row}"));
        }

        fn on_row_change(&mut self, table: TableId, row: RowId, field: FieldId, _db: &Database) {
            self.calls.push(format!("change {table}/{row}/{field}"));
        }

        fn next_transaction_notice(&mut self, txn: TxnId) {
            self.calls.push(format!("txn {txn}"));
        }
    }

    fn database() -> Database {
        let mut db = Database::new(0, DatabaseConfig::default()).unwrap();
        db.register_table::<Fill>(3, 16).unwrap();
        db
    }

    #[test]
    fn test_register_table_errors() {
        let mut db = database();
        assert!(matches!(
            db.register_table::<Fill>(3, 16),
            Err(TesseraError::ConfigError(_))
        ));
        assert!(db.register_table::<Fill>(4, 0).is_err());
        assert!(db.register_table::<Unkeyed>(5, 4).is_err());

        let config = DatabaseConfig {
            max_tables: 4,
            ..Default::default()
        };
        let mut small = Database::new(1, config).unwrap();
        assert!(matches!(
            small.register_table::<Fill>(4, 16),
            Err(TesseraError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_typed_access() {
        let mut db = database();
        assert!(db.table::<Fill>(3).is_some());
        assert!(db.table::<Unkeyed>(3).is_none());
        assert!(db.table::<Fill>(9).is_none());
        assert_eq!(db.table_id("Fill"), Some(3));
        assert_eq!(db.table_ids(), vec![3]);

        let row = db.writer::<Fill>(3).unwrap().copy_object(&Fill::new(1, 100)).unwrap();
        assert_eq!(db.table::<Fill>(3).unwrap().get(row).unwrap().price, 100);
        assert_eq!(db.field_width(3, None), Some(5 + 8));
        assert_eq!(db.field_width(3, Some(Fill::PRICE)), Some(8));
    }

    #[test]
    fn test_commit_orders_notifications() {
        let mut db = database();
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        db.add_listener(recorder.clone());

        let (kept, dropped) = {
            let mut w = db.writer::<Fill>(3).unwrap();
            (w.create().unwrap(), w.create().unwrap())
        };
        assert_eq!(db.commit(), Some(1));

        {
            let mut w = db.writer::<Fill>(3).unwrap();
            w.update(kept, Fill::PRICE, |f| f.price = 7);
            w.remove(dropped);
            w.create().unwrap();
        }
        assert_eq!(db.commit(), Some(2));
        assert_eq!(db.commit(), None);

        let calls = recorder.lock().calls.clone();
        assert_eq!(
            calls,
            vec![
                "add 3/0", "add 3/1", "txn 1",
                "delete 3/1", "add 3/2", "change 3/0/1", "txn 2",
            ]
        );
        assert!(db.log().is_empty());
        assert_eq!(db.transaction_id(), 2);
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut db = database();
        let row = db.writer::<Fill>(3).unwrap().copy_object(&Fill::new(1, 10)).unwrap();
        db.commit();

        {
            let mut w = db.writer::<Fill>(3).unwrap();
            w.update(row, Fill::ORDER, |f| f.order = Some(2));
            w.copy_object(&Fill::new(5, 50)).unwrap();
        }
        assert_eq!(db.rollback(), 2);

        let table = db.table::<Fill>(3).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.find_by_primary_key(&Fill::new(1, 0)).is_some());
        assert!(table.find_by_primary_key(&Fill::new(2, 0)).is_none());
        assert!(db.check_indices());
        assert_eq!(db.commit(), None);
    }

    #[test]
    fn test_empty_commit_restarts_checkpoints() {
        let mut db = database();
        assert_eq!(db.add_checkpoint(), Some(1));
        assert_eq!(db.add_checkpoint(), Some(2));
        assert_eq!(db.commit(), None);
        assert_eq!(db.log().checkpoint(), 0);
        assert_eq!(db.add_checkpoint(), Some(1));
    }

    #[test]
    fn test_rollback_to_checkpoint() {
        let mut db = database();
        let first = db.writer::<Fill>(3).unwrap().create().unwrap();
        assert_eq!(db.add_checkpoint(), Some(1));
        {
            let mut w = db.writer::<Fill>(3).unwrap();
            w.remove(first);
            w.create().unwrap();
        }
        assert_eq!(db.rollback_to(1), 2);

        let table = db.table::<Fill>(3).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.get(first).is_some());
        assert_eq!(db.log().len(), 1);
    }

    #[test]
    fn test_text_dump_and_reload() {
        let mut db = database();
        {
            let mut w = db.writer::<Fill>(3).unwrap();
            w.copy_object(&Fill::new(2, -5)).unwrap();
            w.copy_object(&Fill::new(1, 9)).unwrap();
        }
        let lines = db.dump_text(3).unwrap();
        assert_eq!(lines[0], "Table=Fill,row=1,order=1,price=9");
        assert_eq!(lines[1], "Table=Fill,row=0,order=2,price=-5");

        let mut mirror = database();
        for line in &lines {
            assert!(mirror.load_text(line).unwrap());
        }
        assert_eq!(mirror.row_text(3, 1), db.row_text(3, 1));
        assert!(!mirror.load_text(&lines[0]).unwrap());
        assert!(mirror.load_text("Table=Nope,row=1").is_err());
        assert!(matches!(db.dump_text(8), Err(TesseraError::UnknownTable(8))));
    }

    #[test]
    fn test_apply_and_delete_by_id() {
        let mut db = database();
        let mut bytes = BytesMut::new();
        let source = Fill::new(4, 44);
        source.encode_fields(&mut bytes);

        assert!(db.apply_row(3, 11, None, &bytes).unwrap());
        assert_eq!(db.table::<Fill>(3).unwrap().get(11).unwrap().price, 44);

        let mut out = BytesMut::new();
        assert!(db.row_bytes(3, 11, None, &mut out));
        assert_eq!(out, bytes);

        assert!(db.delete_row(3, 11).unwrap());
        assert!(!db.delete_row(3, 11).unwrap());
        assert!(matches!(db.apply_row(7, 0, None, &bytes), Err(TesseraError::UnknownTable(7))));
    }
}
