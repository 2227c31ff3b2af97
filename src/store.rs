//! Durable instance history
//!
//! The registry hands over numbered snapshots. Writes are serialized and a
//! snapshot is skipped unless its generation is newer than the last one on
//! disk, so an older snapshot can never overwrite a newer one.

use crate::instance::Instance;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    instances: Vec<Instance>,
}

/// JSON file holding every known instance
pub struct StateStore {
    path: PathBuf,
    /// Generation of the last snapshot written
    written: Mutex<u64>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            written: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted instances. A missing file is an empty history; an
    /// unreadable one is logged and also treated as empty.
    pub fn load(&self) -> Vec<Instance> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No instance history yet");
                return Vec::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read instance history");
                return Vec::new();
            }
        };

        match serde_json::from_str::<StateFile>(&content) {
            Ok(state) => state.instances,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to parse instance history, starting empty");
                Vec::new()
            }
        }
    }

    /// Write `instances` if `generation` is newer than what is on disk.
    /// Returns whether the file was written.
    pub fn save_snapshot(&self, generation: u64, instances: &[Instance]) -> anyhow::Result<bool> {
        let mut written = self.written.lock();
        if generation <= *written {
            debug!(generation, written = *written, "Skipping stale snapshot");
            return Ok(false);
        }

        self.write_atomic(instances)?;
        *written = generation;
        Ok(true)
    }

    fn write_atomic(&self, instances: &[Instance]) -> anyhow::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let state = StateFile {
            instances: instances.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to replace instance history");
            anyhow::anyhow!("Failed to persist instance history: {}", e.error)
        })?;

        debug!(path = %self.path.display(), count = instances.len(), "Instance history saved");
        Ok(())
    }
}
