//! Change feed: committed changes published to other threads.
//!
//! The feed is a [`ChangeListener`] that buffers a transaction's callbacks
//! and, on the transaction notice, pushes them into a lock-free ring
//! followed by a commit marker. Readers on other threads consume the ring
//! at their own pace; a reader that falls behind sees
//! [`ReadOutcome::Lagged`](tessera_buffer::ReadOutcome::Lagged).

use crate::database::{ChangeListener, Database};
use tessera_buffer::{spmc_ring, Producer, Reader};
use tessera_common::{FieldId, RowId, TableId, TxnId};

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedKind {
    Insert,
    Delete,
    Update(FieldId),
    /// End of a transaction; `table` and `row` are zero.
    #[default]
    Commit,
}

/// One committed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeEvent {
    pub txn: TxnId,
    pub table: TableId,
    pub row: RowId,
    pub kind: FeedKind,
}

/// Listener that republishes commits into an [`SpmcRing`](tessera_buffer::SpmcRing).
pub struct ChangeFeed {
    producer: Producer<ChangeEvent>,
    pending: Vec<ChangeEvent>,
}

impl ChangeFeed {
    /// Creates a feed with at least `capacity` ring slots and its first reader.
    pub fn new(capacity: usize) -> (Self, Reader<ChangeEvent>) {
        let (producer, reader) = spmc_ring(capacity);
        (
            Self {
                producer,
                pending: Vec::new(),
            },
            reader,
        )
    }

    /// Returns a reader that starts at the next published event.
    pub fn subscribe(&self) -> Reader<ChangeEvent> {
        self.producer.subscribe()
    }

    fn stage(&mut self, table: TableId, row: RowId, kind: FeedKind) {
        self.pending.push(ChangeEvent {
            txn: 0,
            table,
            row,
            kind,
        });
    }
}

impl ChangeListener for ChangeFeed {
    fn on_row_add(&mut self, table: TableId, row: RowId, _db: &Database) {
        self.stage(table, row, FeedKind::Insert);
    }

    fn on_row_delete(&mut self, table: TableId, row: RowId) {
        self.stage(table, row, FeedKind::Delete);
    }

    fn on_row_change(&mut self, table: TableId, row: RowId, field: FieldId, _db: &Database) {
        self.stage(table, row, FeedKind::Update(field));
    }

    fn next_transaction_notice(&mut self, txn: TxnId) {
        for mut event in self.pending.drain(..) {
            event.txn = txn;
            self.producer.push(event);
        }
        self.producer.push(ChangeEvent {
            txn,
            ..Default::default()
        });
    }
}
