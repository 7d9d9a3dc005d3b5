//! Atomic JSON file writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{GatekeeperError, Result};

/// Serialize `value` and atomically replace `path` with it.
///
/// The content is written to a hidden temporary sibling and renamed into place.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(path);
    if let Err(e) = tokio::fs::write(&tmp, &json).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(GatekeeperError::Persistence(format!(
            "failed to move {} into place: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

/// Read and parse a JSON file. A missing file is `Ok(None)`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let random: u16 = rand::rng().random();
    path.with_file_name(format!(".{}.{}-{:04x}.tmp", name, std::process::id(), random))
}
