//! Multicast wire message.
//!
//! Every message starts with a fixed 39-byte header followed by up to
//! [`MAX_PAYLOAD`] opaque payload bytes:
//!
//! | bytes    | field                                   |
//! |----------|-----------------------------------------|
//! | 0..6     | total length, ASCII decimal, NUL padded |
//! | 6        | message type                            |
//! | 7        | stream id                               |
//! | 8        | count (gap-fill requests)               |
//! | 9..29    | sequence, ASCII decimal, NUL padded     |
//! | 29..39   | sender, NUL padded                      |
//!
//! The length field counts the header itself, so a message without payload
//! reports 39. Readers of a byte stream use [`Message::peek_length`] to find
//! message boundaries.

use bytes::{BufMut, Bytes, BytesMut};
use tessera_common::config::SENDER_ID_BYTES;
use tessera_common::{Result, Sequence, StreamId, TesseraError};

/// Width of the ASCII length field.
pub const LENGTH_DIGITS: usize = 6;

/// Width of the ASCII sequence field.
pub const SEQUENCE_DIGITS: usize = 20;

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = LENGTH_DIGITS + 3 + SEQUENCE_DIGITS + SENDER_ID_BYTES;

/// Largest payload a message can carry.
pub const MAX_PAYLOAD: usize = 1450;

/// Largest encoded message.
pub const MAX_MESSAGE_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD;

const TYPE_OFFSET: usize = LENGTH_DIGITS;
const STREAM_OFFSET: usize = TYPE_OFFSET + 1;
const COUNT_OFFSET: usize = STREAM_OFFSET + 1;
const SEQUENCE_OFFSET: usize = COUNT_OFFSET + 1;
const SENDER_OFFSET: usize = SEQUENCE_OFFSET + SEQUENCE_DIGITS;

/// Fixed-width sender tag.
pub type SenderId = [u8; SENDER_ID_BYTES];

/// Builds a sender tag from a name, truncating to the field width.
pub fn sender_id(name: &str) -> SenderId {
    let mut id = [0u8; SENDER_ID_BYTES];
    let n = name.len().min(SENDER_ID_BYTES);
    id[..n].copy_from_slice(&name.as_bytes()[..n]);
    id
}

/// Message types carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Publisher keepalive carrying the last published sequence.
    Heartbeat = 1,
    /// Request to retransmit `count` messages starting at `sequence`.
    GapFill = 2,
    /// Acknowledges every sequence up to and including `sequence`.
    TransmitOk = 3,
    /// Placeholder for a sequence not received yet. Never sent.
    Filler = 4,
    /// Application data.
    Application = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Heartbeat),
            2 => Ok(MessageType::GapFill),
            3 => Ok(MessageType::TransmitOk),
            4 => Ok(MessageType::Filler),
            5 => Ok(MessageType::Application),
            _ => Err(TesseraError::InvalidHeader(format!(
                "unknown message type {}",
                value
            ))),
        }
    }
}

/// A decoded multicast message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub stream: StreamId,
    pub count: u8,
    pub sequence: Sequence,
    pub sender: SenderId,
    pub payload: Bytes,
}

impl Message {
    /// Creates a message with no payload.
    pub fn new(msg_type: MessageType, stream: StreamId, sequence: Sequence) -> Self {
        Self {
            msg_type,
            stream,
            count: 0,
            sequence,
            sender: [0u8; SENDER_ID_BYTES],
            payload: Bytes::new(),
        }
    }

    /// Creates an application message.
    pub fn application(stream: StreamId, sequence: Sequence, payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::new(MessageType::Application, stream, sequence)
        }
    }

    /// Creates a filler placeholder.
    pub fn filler(stream: StreamId, sequence: Sequence) -> Self {
        Self::new(MessageType::Filler, stream, sequence)
    }

    pub fn with_sender(mut self, sender: SenderId) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_count(mut self, count: u8) -> Self {
        self.count = count;
        self
    }

    #[inline]
    pub fn is_filler(&self) -> bool {
        self.msg_type == MessageType::Filler
    }

    /// Encoded size of this message.
    #[inline]
    pub fn len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Returns true if the message carries no payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Sender tag up to its first NUL, or an empty string if it is not UTF-8.
    pub fn sender_name(&self) -> &str {
        let end = self
            .sender
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SENDER_ID_BYTES);
        std::str::from_utf8(&self.sender[..end]).unwrap_or("")
    }

    /// Serializes the message.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Appends the encoded message to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(TesseraError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        buf.reserve(self.len());
        put_digits(buf, self.len() as u64, LENGTH_DIGITS);
        buf.put_u8(self.msg_type as u8);
        buf.put_u8(self.stream);
        buf.put_u8(self.count);
        put_digits(buf, self.sequence, SEQUENCE_DIGITS);
        buf.put_slice(&self.sender);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Parses exactly one message from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(TesseraError::InvalidHeader(format!(
                "{} bytes is shorter than the {}-byte header",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        let length = parse_length(&bytes[..LENGTH_DIGITS])?;
        if length != bytes.len() {
            return Err(TesseraError::InvalidHeader(format!(
                "length field says {} bytes, got {}",
                length,
                bytes.len()
            )));
        }

        let msg_type = MessageType::try_from(bytes[TYPE_OFFSET])?;
        let sequence = parse_digits(&bytes[SEQUENCE_OFFSET..SENDER_OFFSET], "sequence")?;
        let mut sender = [0u8; SENDER_ID_BYTES];
        sender.copy_from_slice(&bytes[SENDER_OFFSET..HEADER_SIZE]);

        Ok(Self {
            msg_type,
            stream: bytes[STREAM_OFFSET],
            count: bytes[COUNT_OFFSET],
            sequence,
            sender,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }

    /// Reads the length field at the start of `bytes`.
    ///
    /// Returns `Ok(None)` while fewer than [`LENGTH_DIGITS`] bytes are
    /// available, and an error if the field cannot describe a valid message.
    pub fn peek_length(bytes: &[u8]) -> Result<Option<usize>> {
        if bytes.len() < LENGTH_DIGITS {
            return Ok(None);
        }
        parse_length(&bytes[..LENGTH_DIGITS]).map(Some)
    }
}

fn put_digits(buf: &mut BytesMut, value: u64, width: usize) {
    let digits = value.to_string();
    buf.put_slice(digits.as_bytes());
    buf.put_bytes(0, width.saturating_sub(digits.len()));
}

fn parse_length(field: &[u8]) -> Result<usize> {
    let length = parse_digits(field, "length")? as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(TesseraError::InvalidHeader(format!(
            "length {} outside {}..={}",
            length, HEADER_SIZE, MAX_MESSAGE_SIZE
        )));
    }
    Ok(length)
}

/// Parses a NUL-padded ASCII decimal field.
fn parse_digits(field: &[u8], name: &str) -> Result<u64> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let (digits, padding) = field.split_at(end);
    if digits.is_empty()
        || !digits.iter().all(u8::is_ascii_digit)
        || padding.iter().any(|&b| b != 0)
    {
        return Err(TesseraError::InvalidHeader(format!(
            "{} field is not NUL-padded ASCII digits",
            name
        )));
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| TesseraError::InvalidHeader(format!("{} field overflows", name)))
}
