//! Backend implementations of the delayed message store
//!
//! - `memory`: In-memory storage for tests and transient hosts
//! - `sqlite`: Relational storage for production use
//! - `test`: Memory storage with fault injection and synchronization helpers

pub mod memory;
pub mod sqlite;
pub mod test;

pub use memory::MemoryDelayedMessageStore;
pub use sqlite::SqliteDelayedMessageStore;
pub use test::{StoreOperation, TestDelayedMessageStore};
