pub mod error;
pub mod eviction;
pub mod store;
pub mod types;

pub use error::MemoryError;
pub use eviction::{select_evictions, EvictionCandidate, EvictionPolicy};
pub use store::{SetOptions, WorkingMemory};
pub use types::{MemoryEntry, MemoryRecord, Priority, Scope, Tier};
