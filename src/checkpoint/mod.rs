//! Durable task snapshots.
//!
//! One JSON file per task id under the checkpoint directory; saving again for the
//! same task overwrites. Expired checkpoints read as missing and are purged by
//! [`CheckpointManager::cleanup`].

mod manager;
mod record;

pub use manager::{CheckpointConfig, CheckpointManager, SaveOutcome};
pub use record::Checkpoint;
