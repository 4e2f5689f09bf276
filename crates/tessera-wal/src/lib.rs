//! Binary change log for Tessera databases.
//!
//! A [`LogSerializer`] subscribes to a database and writes each committed
//! transaction as length-prefixed frames. A [`LogReader`] reads them back
//! and replays them into another database, rebuilding a mirror with the
//! same row ids.

pub mod constants;
pub mod frame;
pub mod reader;
pub mod writer;

pub use frame::{Frame, FrameHeader, Group};
pub use reader::{LogReader, ReplayStats};
pub use writer::LogSerializer;
