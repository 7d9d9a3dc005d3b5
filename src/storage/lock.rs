//! Advisory file lock shared between processes.
//!
//! The lock is a sibling file created with `create_new` and holding an owner
//! token. A holder that crashed leaves its lock file behind; once the file is
//! older than `stale_ms` the next contender moves it aside and takes over.
//! Release only removes the file while it still carries the holder's token.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{GatekeeperError, Result};
use crate::id::now_ms;

/// Lock timing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LockConfig {
    /// Maximum time to wait for the lock (ms).
    pub timeout_ms: u64,
    /// Delay between acquisition attempts (ms).
    pub poll_interval_ms: u64,
    /// Age after which an existing lock is considered abandoned (ms).
    pub stale_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            poll_interval_ms: 25,
            stale_ms: 30_000,
        }
    }
}

/// Path of the lock file guarding `target`.
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".lock");
    target.with_file_name(name)
}

/// Held advisory lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    /// Acquire the lock guarding `target`, waiting at most `config.timeout_ms`.
    pub async fn acquire(target: &Path, config: &LockConfig) -> Result<Self> {
        let path = lock_path_for(target);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let random: u32 = rand::rng().random();
        let token = format!("{}-{}-{:08x}", std::process::id(), now_ms(), random);
        let started = Instant::now();
        let timeout = Duration::from_millis(config.timeout_ms);
        let poll = Duration::from_millis(config.poll_interval_ms.max(1));

        loop {
            let opened = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;
            match opened {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(token.as_bytes()).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(e.into());
                    }
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(owner) = stale_owner(&path, config.stale_ms).await
                        && take_over_stale(&path, &owner, &token).await
                    {
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= timeout {
                return Err(GatekeeperError::Lock(format!(
                    "timed out after {}ms waiting for {}",
                    config.timeout_ms,
                    path.display()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Path of the underlying lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // A holder that was taken over as stale must not remove the new owner's lock
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim() == self.token => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => tracing::warn!(lock = %self.path.display(), "Lock was taken over, leaving it in place"),
            Err(_) => {}
        }
    }
}

/// Contents of the lock file if it is older than `stale_ms`.
async fn stale_owner(path: &Path, stale_ms: u64) -> Option<String> {
    let modified = tokio::fs::metadata(path).await.and_then(|m| m.modified()).ok()?;
    let age = SystemTime::now().duration_since(modified).ok()?;
    if age < Duration::from_millis(stale_ms) {
        return None;
    }
    tokio::fs::read_to_string(path).await.ok()
}

/// Move a stale lock aside, but only if it still holds `owner`.
///
/// The rename is atomic, so of several contenders that saw the same stale lock
/// exactly one moves it. A contender whose rename grabbed a fresh lock instead
/// links it back.
async fn take_over_stale(path: &Path, owner: &str, token: &str) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let aside = path.with_file_name(format!(".{}.{}.stale", name, token));
    if tokio::fs::rename(path, &aside).await.is_err() {
        return false;
    }

    let moved = tokio::fs::read_to_string(&aside).await.unwrap_or_default();
    let cleared = moved == owner;
    if cleared {
        tracing::warn!(lock = %path.display(), owner = %owner.trim(), "Cleared stale lock");
    } else {
        let _ = tokio::fs::hard_link(&aside, path).await;
    }
    let _ = tokio::fs::remove_file(&aside).await;
    cleared
}
