//! Small durable key-value state shared by the watermark registry and the
//! tracking service. Every update is written through before it returns.
use crate::config::StorageConfig;
use crate::types::{EndpointId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STATE_FILENAME: &str = "state.json";

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid state file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub tracking_enabled: bool,
    #[serde(default)]
    pub watermarks: BTreeMap<EndpointId, Timestamp>,
}

pub trait StateBackend: Send + Sync {
    fn load(&self) -> Result<PersistedState, StateError>;
    fn store(&self, state: &PersistedState) -> Result<(), StateError>;
}

/// Keeps nothing across restarts.
pub struct MemoryStateBackend;

impl StateBackend for MemoryStateBackend {
    fn load(&self) -> Result<PersistedState, StateError> {
        Ok(PersistedState::default())
    }

    fn store(&self, _state: &PersistedState) -> Result<(), StateError> {
        Ok(())
    }
}

pub struct FilesystemStateBackend {
    path: PathBuf,
}

impl FilesystemStateBackend {
    pub fn new(base_dir: &Path, filename: &str) -> Self {
        FilesystemStateBackend {
            path: base_dir.join(filename),
        }
    }
}

impl StateBackend for FilesystemStateBackend {
    fn load(&self) -> Result<PersistedState, StateError> {
        match File::open(&self.path) {
            Ok(file) => Ok(serde_json::from_reader(BufReader::new(file))?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, state: &PersistedState) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        serde_json::to_writer(&mut writer, state)?;
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

pub struct StateStore {
    backend: Box<dyn StateBackend>,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Loads the persisted state. An unreadable state file is logged and
    /// replaced by the default state; it is overwritten on the next update.
    pub fn open(backend: Box<dyn StateBackend>) -> Self {
        let state = backend.load().unwrap_or_else(|err| {
            tracing::error!(error = %err, "could not load persisted state, starting fresh");
            PersistedState::default()
        });

        StateStore {
            backend,
            state: Mutex::new(state),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Arc<Self> {
        let backend: Box<dyn StateBackend> = match config {
            StorageConfig::Filesystem { base_dir } => Box::new(FilesystemStateBackend::new(
                Path::new(base_dir),
                STATE_FILENAME,
            )),
            StorageConfig::Memory => Box::new(MemoryStateBackend),
        };
        Arc::new(StateStore::open(backend))
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(StateStore::open(Box::new(MemoryStateBackend)))
    }

    pub fn read<R>(&self, f: impl FnOnce(&PersistedState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Applies `f` and persists the result while holding the lock, so
    /// concurrent updates are written in the order they were applied. If
    /// persisting fails the change is kept in memory only.
    pub fn update<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> Result<R, StateError> {
        let mut guard = self.state.lock();
        let result = f(&mut guard);
        self.backend.store(&guard)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemStateBackend::new(dir.path(), STATE_FILENAME);
        assert_eq!(backend.load().unwrap(), PersistedState::default());

        let store = StateStore::open(Box::new(FilesystemStateBackend::new(
            dir.path(),
            STATE_FILENAME,
        )));
        store
            .update(|state| {
                state.tracking_enabled = true;
                state
                    .watermarks
                    .insert(EndpointId::new("https://a.example.com/"), Timestamp::from_millis(42));
            })
            .unwrap();

        let reopened = StateStore::open(Box::new(FilesystemStateBackend::new(
            dir.path(),
            STATE_FILENAME,
        )));
        assert!(reopened.read(|s| s.tracking_enabled));
        assert_eq!(
            reopened.read(|s| s.watermarks.get(&EndpointId::new("https://a.example.com/")).copied()),
            Some(Timestamp::from_millis(42))
        );
    }

    #[test]
    fn test_state_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(Box::new(FilesystemStateBackend::new(
            dir.path(),
            STATE_FILENAME,
        )));
        store
            .update(|state| {
                state
                    .watermarks
                    .insert(EndpointId::new("https://a.example.com/"), Timestamp::from_millis(7));
            })
            .unwrap();

        let raw = fs::read_to_string(dir.path().join(STATE_FILENAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "tracking_enabled": false,
                "watermarks": { "https://a.example.com/": 7 }
            })
        );
    }

    #[test]
    fn test_corrupt_state_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILENAME), "{not json").unwrap();
        let store = StateStore::open(Box::new(FilesystemStateBackend::new(
            dir.path(),
            STATE_FILENAME,
        )));
        assert_eq!(store.read(|s| s.clone()), PersistedState::default());
    }
}
