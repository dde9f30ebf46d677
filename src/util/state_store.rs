use crate::error::StatError;
use crate::util::ring_buffer::MAX_SLOTS;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const STATE_VERSION: u32 = 1;

/// Full counter state as written to disk at shutdown.
///
/// `slots` is in storage order; `cursor` indexes the current slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub capacity: usize,
    pub cursor: usize,
    pub running_total: u64,
    pub slots: Vec<u64>,
    /// Informational only; not checked on load.
    #[serde(default)]
    pub saved_at: Option<String>,
}

/// Default location: ~/.local/share/reqstat/state.json
pub fn default_state_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("reqstat").join("state.json"))
        .unwrap_or_else(|| PathBuf::from("stats.json"))
}

pub fn encode(state: &PersistedState) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(state)
}

pub fn decode(bytes: &[u8]) -> Result<PersistedState, StatError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(StatError::PersistenceCorrupt("state file is empty".into()));
    }
    let state: PersistedState = serde_json::from_slice(bytes)
        .map_err(|e| StatError::PersistenceCorrupt(e.to_string()))?;
    validate(&state)?;
    Ok(state)
}

fn validate(state: &PersistedState) -> Result<(), StatError> {
    if state.version != STATE_VERSION {
        return Err(StatError::PersistenceCorrupt(format!(
            "unsupported state version {}", state.version
        )));
    }
    if state.capacity == 0 {
        return Err(StatError::PersistenceCorrupt("capacity is zero".into()));
    }
    if state.capacity > MAX_SLOTS {
        return Err(StatError::PersistenceCorrupt(format!(
            "capacity {} exceeds the limit of {} slots", state.capacity, MAX_SLOTS
        )));
    }
    if state.slots.len() != state.capacity {
        return Err(StatError::PersistenceCorrupt(format!(
            "{} slots recorded for capacity {}", state.slots.len(), state.capacity
        )));
    }
    if state.cursor >= state.capacity {
        return Err(StatError::PersistenceCorrupt(format!(
            "cursor {} out of range for capacity {}", state.cursor, state.capacity
        )));
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<PersistedState, StatError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StatError::PersistenceNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(StatError::PersistenceCorrupt(format!("{}: {}", path.display(), e))),
    };
    decode(&bytes)
}

/// Write the state next to `path` and rename it into place, so a crash mid-write
/// leaves the previous checkpoint intact.
pub fn save(path: &Path, state: &PersistedState) -> Result<(), StatError> {
    persist(path, encode(state))
}

/// An encoding failure is reported like a write failure and never touches the file.
fn persist(path: &Path, encoded: serde_json::Result<Vec<u8>>) -> Result<(), StatError> {
    let failed = |source: io::Error| StatError::PersistenceWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let bytes = encoded.map_err(|e| failed(e.into()))?;
    write_atomic(path, &bytes).map_err(failed)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
