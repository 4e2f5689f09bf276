//! Change-log frame format.
//!
//! ```text
//! frame := length:u16 txn:u32 group*
//! group := table:u8 field:u8 row:u32 payload
//! ```
//!
//! All integers are big-endian and `length` counts the whole frame. The
//! field code is 255 for a delete (no payload), 254 for an insert (payload
//! is every field of the record) and otherwise a field id (payload is that
//! field). Payload widths are not stored, so decoding a frame needs the
//! table schema.

use crate::constants::{FRAME_HEADER_SIZE, GROUP_HEADER_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessera_common::{FieldId, Result, RowId, TableId, TesseraError, TxnId};
use tessera_storage::ChangeKind;

/// Fixed header at the start of each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length, header included.
    pub length: u16,
    pub txn: TxnId,
}

impl FrameHeader {
    /// Appends the header bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.length);
        buf.put_u32(self.txn);
    }

    /// Overwrites the header at the front of a frame being built.
    pub fn write_into(&self, frame: &mut [u8]) {
        let mut header = &mut frame[..FRAME_HEADER_SIZE];
        header.put_u16(self.length);
        header.put_u32(self.txn);
    }

    /// Length of the body that follows the header.
    pub fn body_len(&self) -> usize {
        (self.length as usize).saturating_sub(FRAME_HEADER_SIZE)
    }
}

impl TryFrom<&[u8]> for FrameHeader {
    type Error = TesseraError;

    fn try_from(mut data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(TesseraError::FrameTruncated {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let length = data.get_u16();
        let txn = data.get_u32();
        if (length as usize) < FRAME_HEADER_SIZE {
            return Err(TesseraError::FrameCorrupted {
                offset: 0,
                reason: format!("frame length {} shorter than header", length),
            });
        }
        Ok(Self { length, txn })
    }
}

/// One change inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub table: TableId,
    pub kind: ChangeKind,
    pub row: RowId,
    pub payload: Bytes,
}

impl Group {
    /// Encoded size of a group carrying `payload_len` bytes.
    #[inline]
    pub fn encoded_len(payload_len: usize) -> usize {
        GROUP_HEADER_SIZE + payload_len
    }

    /// Appends the group header; the caller appends the payload.
    pub fn encode_header(table: TableId, kind: ChangeKind, row: RowId, buf: &mut BytesMut) {
        buf.put_u8(table);
        buf.put_u8(kind.code());
        buf.put_u32(row);
    }

    /// Appends the whole group.
    pub fn encode(&self, buf: &mut BytesMut) {
        Self::encode_header(self.table, self.kind, self.row, buf);
        buf.put_slice(&self.payload);
    }
}

/// A frame read back from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub txn: TxnId,
    /// Byte offset of the frame within the log.
    pub offset: u64,
    /// Group bytes following the header.
    pub body: Bytes,
}

impl Frame {
    /// Builds a frame from groups, mainly for tests and tools.
    pub fn encode(txn: TxnId, groups: &[Group]) -> Result<Bytes> {
        let body: usize = groups.iter().map(|g| Group::encoded_len(g.payload.len())).sum();
        let length = FRAME_HEADER_SIZE + body;
        if length > MAX_FRAME_SIZE {
            return Err(TesseraError::PayloadTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(length);
        FrameHeader {
            length: length as u16,
            txn,
        }
        .encode(&mut buf);
        for group in groups {
            group.encode(&mut buf);
        }
        Ok(buf.freeze())
    }

    /// Splits the body into groups.
    ///
    /// `width` returns the payload width for a table's whole record
    /// (`None`) or one of its fields; it is normally
    /// [`Database::field_width`](tessera_storage::Database::field_width).
    pub fn groups<F>(&self, width: F) -> Result<Vec<Group>>
    where
        F: Fn(TableId, Option<FieldId>) -> Option<usize>,
    {
        let mut groups = Vec::new();
        let mut body = self.body.clone();
        while body.has_remaining() {
            let at = self.offset + (FRAME_HEADER_SIZE + self.body.len() - body.len()) as u64;
            if body.remaining() < GROUP_HEADER_SIZE {
                return Err(TesseraError::FrameCorrupted {
                    offset: at,
                    reason: format!("{} trailing bytes", body.remaining()),
                });
            }
            let table = body.get_u8();
            let kind = ChangeKind::from_code(body.get_u8());
            let row = body.get_u32();

            let payload_len = match kind {
                ChangeKind::Delete => 0,
                ChangeKind::Insert => width(table, None).ok_or(TesseraError::UnknownTable(table))?,
                ChangeKind::Update(field) => {
                    width(table, None).ok_or(TesseraError::UnknownTable(table))?;
                    width(table, Some(field)).ok_or_else(|| TesseraError::FieldNotFound {
                        table: table.to_string(),
                        field: field.to_string(),
                    })?
                }
            };
            if body.remaining() < payload_len {
                return Err(TesseraError::FrameCorrupted {
                    offset: at,
                    reason: format!(
                        "group for table {} row {} needs {} payload bytes, {} left",
                        table,
                        row,
                        payload_len,
                        body.remaining()
                    ),
                });
            }
            let payload = body.split_to(payload_len);
            groups.push(Group {
                table,
                kind,
                row,
                payload,
            });
        }
        Ok(groups)
    }
}
