use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeJob(serde_json::Error),
    DeserializeJob(serde_json::Error),
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported persistence.engine '{engine}'; currently only 'sled' is supported"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve persistence path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create persistence data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeJob(source) => {
                write!(f, "failed to serialize job record for storage: {source}")
            }
            Self::DeserializeJob(source) => {
                write!(f, "failed to deserialize job record from storage: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}
