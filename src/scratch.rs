//! Scratch-space handling for downloaded videos: the size gate, the guard that
//! guarantees each artifact is deleted, and a startup sweep for leftovers.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::GateError;

const UUID_LEN: usize = 36;
const ARTIFACT_SUFFIX: &str = ".mp4";
const PARTIAL_SUFFIX: &str = ".part";

/// Checks that the downloader actually produced `path` and that it fits under
/// `limit` bytes. An oversized file is removed before the error is returned.
pub async fn validate_size(path: &Path, limit: u64) -> Result<u64, GateError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| GateError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;

    let size = metadata.len();
    if size > limit {
        warn!(size, limit, "Video is too large");
        if let Err(err) = tokio::fs::remove_file(path).await {
            error!(error = %err, path = %path.display(), "Failed to remove video file");
        }
        return Err(GateError::TooLarge { size, limit });
    }

    Ok(size)
}

/// Owns a downloaded artifact and deletes it (plus any `.part` leftover) when
/// dropped.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        // Drop cannot await; these are plain unlinks on the worker thread.
        for path in [self.path.clone(), self.partial_path()] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed scratch file"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Failed to remove scratch file")
                }
            }
        }
    }
}

/// True for names the pipeline generates: `<uuid>.mp4`, optionally followed by
/// yt-dlp's `.part` suffix.
fn is_scratch_artifact(name: &str) -> bool {
    let (Some(stem), Some(rest)) = (name.get(..UUID_LEN), name.get(UUID_LEN..)) else {
        return false;
    };
    Uuid::parse_str(stem).is_ok()
        && rest.strip_suffix(PARTIAL_SUFFIX).unwrap_or(rest) == ARTIFACT_SUFFIX
}

/// Deletes artifacts a previous process left behind, e.g. after a crash
/// mid-download. Other files in the directory are left alone.
pub fn sweep_stale(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_scratch_artifact(name) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => warn!(error = %err, file = name, "Failed to remove stale scratch file"),
        }
    }
    if removed > 0 {
        info!(removed, dir = %dir.display(), "Removed stale scratch files");
    }
    Ok(removed)
}
