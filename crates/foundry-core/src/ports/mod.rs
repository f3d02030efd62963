//! Ports - abstraction layer.
//!
//! Each trait is a seam towards something outside the core: the queue
//! backend, time, id minting, asset storage and the commit collaborator.

pub mod asset_store;
pub mod clock;
pub mod commit_sink;
pub mod id_generator;
pub mod queue_store;

pub use self::asset_store::AssetStore;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::commit_sink::CommitSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_store::{QueueStore, StrandedTask};
