//! Domain model (IDs, task records, assets).

pub mod asset;
pub mod ids;
pub mod task;

pub use asset::{
    AssetDescriptor, AssetKind, AssetRequest, PipelineOutcome, TargetSize, TaskResult,
    asset_filename,
};
pub use ids::{Role, TaskId};
pub use task::{NewTask, Payload, TaskRecord, TaskStatus, TransitionError};
