// Durable snapshot of model statuses, replaced atomically on every write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use super::error::StoreError;
use crate::types::PersistedState;
use crate::{sys_debug, sys_warn};

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the full snapshot.
    ///
    /// The bytes go to a sibling temp file which is fsynced and then renamed
    /// over the target, so readers see either the old or the new snapshot.
    pub fn persist_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        let mut snapshot = state.clone();
        snapshot.saved_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|source| self.io_err(&dir, source))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let result = write_synced(&tmp_path, &bytes)
            .and_then(|()| fs::rename(&tmp_path, &self.path));
        if let Err(source) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(self.io_err(&self.path, source));
        }

        sys_debug!(
            "[STATE] Persisted {} model(s) to {}",
            snapshot.models.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the last snapshot. Missing or unreadable files yield an empty state.
    pub fn load(&self) -> PersistedState {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return PersistedState::default(),
            Err(e) => {
                sys_warn!("[STATE] Cannot read {}: {}", self.path.display(), e);
                return PersistedState::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(state) => state,
            Err(e) => {
                sys_warn!(
                    "[STATE] Ignoring corrupt state file {}: {}",
                    self.path.display(),
                    e
                );
                PersistedState::default()
            }
        }
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
