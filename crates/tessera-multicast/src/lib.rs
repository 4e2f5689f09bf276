//! Reliable sequenced multicast for Tessera.
//!
//! Publishers number every message of a stream and multicast it once.
//! Subscribers detect gaps from the sequence numbers (or from idle
//! heartbeats), fetch the missing messages over a point-to-point recovery
//! connection and acknowledge what they hold so upstream buffers can be
//! flushed.
//!
//! Provides:
//! - `Message` wire codec
//! - `Stream` sequencing state
//! - `Transport` with socket (`NetTransport`) and in-process (`MemoryTransport`) implementations
//! - `ReliableMulticastChannel` driving all of the above

pub mod channel;
pub mod clock;
pub mod memory;
pub mod message;
pub mod stream;
pub mod transport;

pub use channel::ReliableMulticastChannel;
pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{
    sender_id, Message, MessageType, SenderId, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_PAYLOAD,
};
pub use stream::{ClientState, Receive, Stream, StreamState};
pub use transport::{NetTransport, Transport, TransportEvent};
