//! Repository Layer
//!
//! Remote store abstractions and the in-memory implementation.

mod memory;
mod traits;

pub use memory::{MemoryRemote, RemoteOp};
pub use traits::{ChangeFeed, RecordFilter, RemoteStore, Repository};
