//! Bounded buffers shared by the Tessera database and multicast channel.
//!
//! Provides:
//! - `SequencedBuffer` for numbered, prefix-flushable history
//! - `SpmcRing` for handing fixed-size values to other threads

pub mod sequenced;
pub mod spmc;

pub use sequenced::SequencedBuffer;
pub use spmc::{spmc_ring, Producer, ReadOutcome, Reader, SpmcRing};
