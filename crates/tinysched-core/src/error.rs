use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid {kind} {value:?}")]
    InvalidIdent { kind: &'static str, value: String },

    #[error("path {path} escapes {base}")]
    PathEscape { base: PathBuf, path: PathBuf },

    #[error("lease already exists for task {0}")]
    LeaseConflict(String),

    #[error("malformed lease file {path}: {source}")]
    MalformedLease {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("task service unreachable after {attempts} attempts: {last}")]
    RemoteTransient { attempts: u32, last: String },

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
