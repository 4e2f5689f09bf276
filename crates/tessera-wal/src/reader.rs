//! Change-log reader and replay.
//!
//! [`LogReader`] walks a log from the start, one length-prefixed frame at a
//! time. [`LogReader::replay`] applies every group to a target database by
//! table id, which is how a mirror is rebuilt from a primary's log.

use crate::constants::FRAME_HEADER_SIZE;
use crate::frame::{Frame, FrameHeader};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tessera_common::{Result, TesseraError, TxnId};
use tessera_storage::{ChangeKind, Database};
use tracing::{debug, info};

/// Counters from a replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub frames: u64,
    /// Transactions committed on the target.
    pub transactions: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Groups the target could not apply (row missing or slot taken).
    pub skipped: u64,
}

/// Sequential frame reader over any byte source.
pub struct LogReader<R: Read> {
    source: R,
    /// Offset of the next frame.
    offset: u64,
}

impl LogReader<BufReader<File>> {
    /// Opens a log file for reading from the start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(source: R) -> Self {
        Self { source, offset: 0 }
    }

    /// Byte offset of the next frame.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads until `buf` is full or the source ends; returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Reads the next frame. Returns `Ok(None)` at a clean end of log.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let read = self.fill(&mut header)?;
        if read == 0 {
            return Ok(None);
        }
        if read < FRAME_HEADER_SIZE {
            return Err(TesseraError::FrameTruncated {
                expected: FRAME_HEADER_SIZE,
                actual: read,
            });
        }
        let header = FrameHeader::try_from(&header[..]).map_err(|e| match e {
            TesseraError::FrameCorrupted { reason, .. } => TesseraError::FrameCorrupted {
                offset: self.offset,
                reason,
            },
            other => other,
        })?;

        let mut body = vec![0u8; header.body_len()];
        let read = self.fill(&mut body)?;
        if read < body.len() {
            return Err(TesseraError::FrameTruncated {
                expected: header.length as usize,
                actual: FRAME_HEADER_SIZE + read,
            });
        }

        let frame = Frame {
            txn: header.txn,
            offset: self.offset,
            body: Bytes::from(body),
        };
        self.offset += header.length as u64;
        Ok(Some(frame))
    }

    /// Applies every remaining frame to `db`.
    ///
    /// Groups are applied in stored order. Inserts carry the source row id
    /// and act as upserts; updates overwrite one field. Consecutive frames
    /// with the same transaction id are committed on the target as one
    /// transaction.
    pub fn replay(&mut self, db: &mut Database) -> Result<ReplayStats> {
        let mut stats = ReplayStats::default();
        let mut current: Option<TxnId> = None;

        while let Some(frame) = self.next_frame()? {
            if current.map_or(false, |txn| txn != frame.txn) && db.commit().is_some() {
                stats.transactions += 1;
            }
            current = Some(frame.txn);
            stats.frames += 1;

            let groups = frame.groups(|table, field| db.field_width(table, field))?;
            for group in groups {
                let applied = match group.kind {
                    ChangeKind::Delete => {
                        stats.deletes += 1;
                        db.delete_row(group.table, group.row)?
                    }
                    ChangeKind::Insert => {
                        stats.inserts += 1;
                        db.apply_row(group.table, group.row, None, &group.payload)?
                    }
                    ChangeKind::Update(field) => {
                        stats.updates += 1;
                        db.apply_row(group.table, group.row, Some(field), &group.payload)?
                    }
                };
                if !applied {
                    stats.skipped += 1;
                    debug!(
                        txn = frame.txn,
                        table = group.table,
                        row = group.row,
                        code = group.kind.code(),
                        "group not applied"
                    );
                }
            }
        }
        if db.commit().is_some() {
            stats.transactions += 1;
        }
        info!(
            frames = stats.frames,
            transactions = stats.transactions,
            skipped = stats.skipped,
            "change log replayed"
        );
        Ok(stats)
    }
}

impl<R: Read> Iterator for LogReader<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Group;
    use std::io::Cursor;

    fn delete(table: u8, row: u32) -> Group {
        Group {
            table,
            kind: ChangeKind::Delete,
            row,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn test_reads_frames_in_order() {
        let mut log = Vec::new();
        log.extend_from_slice(&Frame::encode(1, &[delete(2, 5)]).unwrap());
        log.extend_from_slice(&Frame::encode(2, &[delete(2, 6), delete(3, 7)]).unwrap());

        let mut reader = LogReader::new(Cursor::new(log));
        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!(first.txn, 1);
        assert_eq!(first.offset, 0);
        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(second.txn, 2);
        assert_eq!(second.offset, 12);
        assert_eq!(second.body.len(), 12);
        assert!(reader.next_frame().unwrap().is_none());
        assert_eq!(reader.offset(), 30);
    }

    #[test]
    fn test_iterator_yields_frames() {
        let mut log = Vec::new();
        for txn in 1..=3 {
            log.extend_from_slice(&Frame::encode(txn, &[delete(0, txn)]).unwrap());
        }
        let txns: Vec<u32> = LogReader::new(&log[..]).map(|f| f.unwrap().txn).collect();
        assert_eq!(txns, vec![1, 2, 3]);
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let frame = Frame::encode(1, &[delete(2, 5)]).unwrap();
        let mut reader = LogReader::new(&frame[..9]);
        assert!(matches!(
            reader.next_frame(),
            Err(TesseraError::FrameTruncated { expected: 12, actual: 9 })
        ));

        let mut reader = LogReader::new(&frame[..3]);
        assert!(matches!(
            reader.next_frame(),
            Err(TesseraError::FrameTruncated { expected: 6, actual: 3 })
        ));
    }

    #[test]
    fn test_corrupt_length_reports_offset() {
        let mut log = Frame::encode(1, &[delete(2, 5)]).unwrap().to_vec();
        log.extend_from_slice(&[0, 1, 0, 0, 0, 0]);
        let mut reader = LogReader::new(Cursor::new(log));
        reader.next_frame().unwrap();
        match reader.next_frame() {
            Err(TesseraError::FrameCorrupted { offset, .. }) => assert_eq!(offset, 12),
            other => panic!("unexpected {:?}", other),
        }
    }
}
