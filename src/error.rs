use std::io;
use std::path::PathBuf;

/// Errors surfaced by the counter core and its persistence layer.
///
/// `increment`, `rotate` and `snapshot` never produce one of these.
#[derive(Debug, thiserror::Error)]
pub enum StatError {
    /// Window configuration that cannot produce a ring buffer (zero slots, zero precision).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No state file at the given path. Callers start from zeroed state.
    #[error("no persisted state at {}", .0.display())]
    PersistenceNotFound(PathBuf),

    /// The state file exists but does not hold a usable record.
    #[error("persisted state is corrupt: {0}")]
    PersistenceCorrupt(String),

    /// Writing the checkpoint failed. The previous checkpoint is left in place.
    #[error("failed to write state to {}: {source}", path.display())]
    PersistenceWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
