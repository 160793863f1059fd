use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::jobs::JobPriority;

use super::StorageError;

/// Durable copy of a background job. Written when the job is accepted and removed once it
/// completes or is cancelled.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub function: String,
    /// Hex-encoded unique id.
    pub unique_id: String,
    pub handle: String,
    pub payload: Vec<u8>,
    pub priority: JobPriority,
    pub created_at: DateTime<Utc>,
}

pub trait Persistence: Send + Sync {
    fn write(&self, record: &JobRecord) -> Result<(), StorageError>;

    fn remove(&self, function: &str, unique_id_hex: &str) -> Result<(), StorageError>;

    /// Records of one function, or of every function when `function` is `None`.
    fn load_records(&self, function: Option<&str>) -> Result<Vec<JobRecord>, StorageError>;

    fn flush(&self) -> Result<(), StorageError>;
}
