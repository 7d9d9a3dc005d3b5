//! Shared persistence primitives.
//!
//! Every store Gatekeeper writes to disk (checkpoints, learned limits, limit
//! overrides) goes through the same two primitives:
//! - **Advisory file lock**: a sibling `.lock` file with bounded wait, polling
//!   interval and stale-holder takeover
//! - **Atomic write**: content lands in a temporary file and is renamed into
//!   place, so readers never observe a partial write

mod atomic;
mod lock;

pub use atomic::{read_json, remove_if_exists, write_json_atomic};
pub use lock::{FileLock, LockConfig, lock_path_for};
