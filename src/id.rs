//! ID generation utilities for Gatekeeper
//!
//! Provides the wall clock and identifiers for tasks and checkpoints.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a unique task ID
///
/// Format: `task-{timestamp_ms}-{random_hex}`
/// Example: `task-1738300800123-a1b2`
pub fn generate_task_id() -> String {
    let random: u16 = rand::rng().random();
    format!("task-{}-{:04x}", now_ms(), random)
}

/// Generate a checkpoint ID for a task
///
/// Format: `ckpt-{task_id}-{timestamp_ms}-{random_hex}`
pub fn generate_checkpoint_id(task_id: &str) -> String {
    let random: u16 = rand::rng().random();
    format!("ckpt-{}-{}-{:04x}", task_id, now_ms(), random)
}

/// Build a filesystem-safe file stem from an arbitrary identifier.
///
/// `[A-Za-z0-9_-]` pass through; every other byte becomes `%XX`. Distinct ids
/// always map to distinct stems.
pub fn file_stem(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{:02X}", byte));
        }
    }
    stem
}
