//! Impls - port implementations.
//!
//! # Queue backends
//! - **DirectoryQueue**: one JSON file per task, partitions are directories
//! - **StreamQueue**: Redis streams with one consumer group per role
//! - **MemoryQueue**: in-process, for tests and embedding
//!
//! # Output
//! - **FsAssetStore**: writes generated images below the output root
//! - **NoopCommitSink**: logs instead of committing

pub mod directory_queue;
pub mod fs_asset_store;
pub mod memory_queue;
pub mod noop_commit;
pub mod stream_queue;


pub use self::directory_queue::DirectoryQueue;
pub use self::fs_asset_store::FsAssetStore;
pub use self::memory_queue::MemoryQueue;
pub use self::noop_commit::NoopCommitSink;
pub use self::stream_queue::{StreamQueue, StreamQueueSettings};
