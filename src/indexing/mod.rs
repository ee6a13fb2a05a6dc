//! Indexing pipeline: coordinator, process pool, wire protocol, and the
//! in-memory indexes the query engine reads.

pub mod coordinator;
pub mod file_info;
pub mod memory;
pub mod pool;
pub mod protocol;

pub use coordinator::{IndexOutcome, IndexingStatus, ProjectIndexer, StatusHandle};
pub use file_info::{hash_bytes, hash_file, utc_timestamp};
pub use memory::{SymbolIndexes, merge_symbols};
pub use pool::{PoolConfig, WorkerCommand, WorkerPool};
pub use protocol::{WorkerJob, WorkerReply};
