//! Change-log serializer.
//!
//! [`LogSerializer`] listens to a database and packs every committed
//! change into frames. Groups accumulate in one buffer; the frame is written
//! when the next group would overflow the buffer, or when a transaction
//! notice arrives with groups pending.

use crate::constants::{FRAME_HEADER_SIZE, GROUP_HEADER_SIZE, MAX_FRAME_SIZE};
use crate::frame::{FrameHeader, Group};
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tessera_common::{FieldId, Result, RowId, SerializerConfig, TableId, TxnId};
use tessera_storage::{ChangeKind, ChangeListener, Database};
use tracing::{debug, error, warn};

/// Writes committed changes as frames to a byte sink.
pub struct LogSerializer<W: Write + Send> {
    sink: W,
    /// Frame under construction; the first `FRAME_HEADER_SIZE` bytes are
    /// patched when the frame is written.
    buffer: BytesMut,
    max_bytes: usize,
    /// Transaction id from the most recent notice.
    last_notice: TxnId,
    frames_written: u64,
    bytes_written: u64,
    /// Frames lost to sink errors.
    write_failures: u64,
}

impl LogSerializer<BufWriter<File>> {
    /// Opens (or creates) an append-only log file.
    pub fn create(path: impl AsRef<Path>, config: SerializerConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Self::new(BufWriter::new(file), config)
    }
}

impl<W: Write + Send> LogSerializer<W> {
    /// Creates a serializer writing to `sink`.
    pub fn new(sink: W, config: SerializerConfig) -> Result<Self> {
        config.validate()?;
        let mut buffer = BytesMut::with_capacity(config.buffer_bytes);
        buffer.resize(FRAME_HEADER_SIZE, 0);
        Ok(Self {
            sink,
            buffer,
            max_bytes: config.buffer_bytes,
            last_notice: 0,
            frames_written: 0,
            bytes_written: 0,
            write_failures: 0,
        })
    }

    #[inline]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    #[inline]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    #[inline]
    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    /// Returns true if groups are waiting for a transaction notice.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.buffer.len() > FRAME_HEADER_SIZE
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Flushes the sink.
    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()?;
        Ok(())
    }

    /// Returns the sink. Pending groups that were never closed by a
    /// transaction notice are discarded.
    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Makes room for a group of `payload_len` bytes, writing the current
    /// frame if needed. Returns false if the group can never fit a frame.
    fn reserve(&mut self, table: TableId, row: RowId, payload_len: usize) -> bool {
        let group_len = GROUP_HEADER_SIZE + payload_len;
        if FRAME_HEADER_SIZE + group_len > MAX_FRAME_SIZE {
            warn!(table, row, group_len, "group exceeds maximum frame size, dropped");
            return false;
        }
        if self.buffer.len() + group_len > self.max_bytes && self.has_pending() {
            // Mid-transaction overflow: the frame belongs to the transaction
            // being committed, which is one past the last notice.
            self.write_frame(self.last_notice.wrapping_add(1));
        }
        true
    }

    fn write_frame(&mut self, txn: TxnId) {
        let length = self.buffer.len();
        FrameHeader {
            length: length as u16,
            txn,
        }
        .write_into(&mut self.buffer);

        let written = self
            .sink
            .write_all(&self.buffer)
            .and_then(|_| self.sink.flush());
        match written {
            Ok(()) => {
                self.frames_written += 1;
                self.bytes_written += length as u64;
                debug!(txn, length, "frame written");
            }
            Err(e) => {
                self.write_failures += 1;
                error!(txn, length, error = %e, "failed to write change-log frame");
            }
        }
        self.buffer.truncate(FRAME_HEADER_SIZE);
    }

    fn pack_row(&mut self, table: TableId, row: RowId, field: Option<FieldId>, db: &Database) {
        if !db.contains(table, row) {
            return;
        }
        let Some(width) = db.field_width(table, field) else {
            warn!(table, ?field, "no width for change-log group");
            return;
        };
        if !self.reserve(table, row, width) {
            return;
        }
        let kind = match field {
            Some(f) => ChangeKind::Update(f),
            None => ChangeKind::Insert,
        };
        let mark = self.buffer.len();
        Group::encode_header(table, kind, row, &mut self.buffer);
        if !db.row_bytes(table, row, field, &mut self.buffer) {
            self.buffer.truncate(mark);
        }
    }
}

impl<W: Write + Send> ChangeListener for LogSerializer<W> {
    fn on_row_add(&mut self, table: TableId, row: RowId, db: &Database) {
        self.pack_row(table, row, None, db);
    }

    fn on_row_delete(&mut self, table: TableId, row: RowId) {
        if self.reserve(table, row, 0) {
            Group::encode_header(table, ChangeKind::Delete, row, &mut self.buffer);
        }
    }

    fn on_row_change(&mut self, table: TableId, row: RowId, field: FieldId, db: &Database) {
        self.pack_row(table, row, Some(field), db);
    }

    fn next_transaction_notice(&mut self, txn: TxnId) {
        if self.has_pending() {
            self.write_frame(txn);
        }
        self.last_notice = txn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameHeader;
    use parking_lot::Mutex;
    use std::cmp::Ordering;
    use std::sync::Arc;
    use tessera_common::DatabaseConfig;
    use tessera_storage::{compare_key, define_record, KeyMatch, Record};

    define_record! {
        pub struct Level = "Level" {
            [PRICE = 0] index price: Option<i64>,
            [QTY = 1] plain qty: u32,
        }
        indices {
            "PrimaryKey" => Level::by_price,
        }
    }

    impl Level {
        fn by_price(a: &Self, b: &Self, m: KeyMatch) -> Ordering {
            compare_key(&a.price, &b.price, m)
        }
    }

    fn setup(buffer_bytes: usize) -> (Database, Arc<Mutex<LogSerializer<Vec<u8>>>>) {
        let mut db = Database::new(0, DatabaseConfig::default()).unwrap();
        db.register_table::<Level>(4, 32).unwrap();
        let serializer = LogSerializer::new(Vec::new(), SerializerConfig { buffer_bytes }).unwrap();
        let serializer = Arc::new(Mutex::new(serializer));
        db.add_listener(serializer.clone());
        (db, serializer)
    }

    fn frame_headers(bytes: &[u8]) -> Vec<FrameHeader> {
        let mut headers = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let header = FrameHeader::try_from(rest).unwrap();
            rest = &rest[header.length as usize..];
            headers.push(header);
        }
        headers
    }

    #[test]
    fn test_invalid_config() {
        assert!(LogSerializer::new(Vec::new(), SerializerConfig { buffer_bytes: 6 }).is_err());
        assert!(LogSerializer::new(Vec::new(), SerializerConfig { buffer_bytes: 70_000 }).is_err());
    }

    #[test]
    fn test_one_frame_per_transaction() {
        let (mut db, serializer) = setup(1500);
        let row = db.writer::<Level>(4).unwrap().create().unwrap();
        db.commit();
        db.writer::<Level>(4).unwrap().update(row, Level::QTY, |l| l.qty = 3);
        db.commit();

        let out = serializer.lock();
        let headers = frame_headers(out.get_ref());
        // Insert: 6 + 6 + (9 + 4); update: 6 + 6 + 4.
        assert_eq!(
            headers,
            vec![
                FrameHeader { length: 25, txn: 1 },
                FrameHeader { length: 16, txn: 2 },
            ]
        );
        assert_eq!(out.frames_written(), 2);
        assert!(!out.has_pending());
    }

    #[test]
    fn test_overflow_splits_transaction() {
        let (mut db, serializer) = setup(40);
        {
            let mut w = db.writer::<Level>(4).unwrap();
            for _ in 0..5 {
                w.create().unwrap();
            }
        }
        db.commit();

        let out = serializer.lock();
        let headers = frame_headers(out.get_ref());
        // Each insert group is 19 bytes, so a 40-byte buffer holds one.
        assert_eq!(headers.len(), 5);
        assert!(headers.iter().all(|h| h.txn == 1 && h.length as usize <= 40));
    }

    #[test]
    fn test_deleted_rows_skip_payload_groups() {
        let (mut db, serializer) = setup(1500);
        {
            let mut w = db.writer::<Level>(4).unwrap();
            let row = w.create().unwrap();
            w.update(row, Level::QTY, |l| l.qty = 1);
            w.remove(row);
        }
        db.commit();

        let out = serializer.lock();
        let bytes = out.get_ref();
        // Only the delete group survives.
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[6..], &[4, 255, 0, 0, 0, 0]);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("changes.log");
        for _ in 0..2 {
            let mut db = Database::new(0, DatabaseConfig::default()).unwrap();
            db.register_table::<Level>(4, 4).unwrap();
            let serializer = Arc::new(Mutex::new(
                LogSerializer::create(&path, SerializerConfig::default()).unwrap(),
            ));
            db.add_listener(serializer.clone());
            db.writer::<Level>(4).unwrap().create().unwrap();
            db.commit();
            serializer.lock().flush().unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(frame_headers(&bytes).len(), 2);
        assert_eq!(Level::record_width(), 13);
    }
}
