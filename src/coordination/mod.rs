//! Checkpointed, constraint-aware loading of a vocabulary directory

pub mod checkpoint;
pub mod committer;
pub mod orchestrator;

pub use checkpoint::{CheckpointStore, TableCheckpointStore};
pub use committer::FileReport;
pub use orchestrator::{LoadConfigBuilder, LoadResult, Orchestrator};
