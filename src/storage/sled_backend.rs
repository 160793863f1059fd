use std::path::Path;

use super::{JobRecord, Persistence, StorageError};

const KEYSPACE_VERSION: &str = "v1";
const JOB_PREFIX: &str = "v1:j:";

pub struct SledPersistence {
    db: sled::Db,
}

impl SledPersistence {
    pub fn open(data_path: &Path, cache_capacity: Option<u64>) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StorageError::Sled)?;
        Ok(Self { db })
    }
}

fn job_key(function: &str, unique_id_hex: &str) -> String {
    format!("{KEYSPACE_VERSION}:j:{function}:{unique_id_hex}")
}

fn function_prefix(function: &str) -> String {
    format!("{JOB_PREFIX}{function}:")
}

impl Persistence for SledPersistence {
    fn write(&self, record: &JobRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeJob)?;
        self.db
            .insert(job_key(&record.function, &record.unique_id).as_bytes(), value)
            .map_err(StorageError::Sled)?;
        self.flush()
    }

    fn remove(&self, function: &str, unique_id_hex: &str) -> Result<(), StorageError> {
        self.db
            .remove(job_key(function, unique_id_hex).as_bytes())
            .map_err(StorageError::Sled)?;
        self.flush()
    }

    fn load_records(&self, function: Option<&str>) -> Result<Vec<JobRecord>, StorageError> {
        let prefix = function.map_or_else(|| JOB_PREFIX.to_owned(), function_prefix);

        let mut records = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_, value) = entry.map_err(StorageError::Sled)?;
            let record: JobRecord =
                serde_json::from_slice(value.as_ref()).map_err(StorageError::DeserializeJob)?;
            records.push(record);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::orchestrator::jobs::JobPriority;
    use crate::storage::{JobRecord, Persistence};

    use super::{SledPersistence, job_key};

    fn record(function: &str, unique_id: &str) -> JobRecord {
        JobRecord {
            function: function.to_owned(),
            unique_id: unique_id.to_owned(),
            handle: format!("H:test:{unique_id}"),
            payload: vec![1, 2, 3],
            priority: JobPriority::High,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn job_keys_are_versioned_and_scoped_by_function() {
        assert_eq!(job_key("resize", "00ab"), "v1:j:resize:00ab");
    }

    #[test]
    fn records_are_scanned_per_function() {
        let persistence = SledPersistence::temporary().expect("temporary sled should open");
        persistence
            .write(&record("resize", "01"))
            .expect("write should succeed");
        persistence
            .write(&record("resize", "02"))
            .expect("write should succeed");
        persistence
            .write(&record("resize-large", "03"))
            .expect("write should succeed");

        let resize = persistence
            .load_records(Some("resize"))
            .expect("scan should succeed");
        assert_eq!(resize.len(), 2);
        assert!(resize.iter().all(|record| record.function == "resize"));

        let all = persistence.load_records(None).expect("scan should succeed");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn rewriting_a_unique_id_replaces_the_record() {
        let persistence = SledPersistence::temporary().expect("temporary sled should open");
        let mut first = record("resize", "aa");
        persistence.write(&first).expect("write should succeed");
        first.payload = b"second".to_vec();
        persistence.write(&first).expect("write should succeed");

        let records = persistence
            .load_records(Some("resize"))
            .expect("scan should succeed");
        assert_eq!(records, vec![first]);
    }

    #[test]
    fn removed_records_are_no_longer_loaded() {
        let persistence = SledPersistence::temporary().expect("temporary sled should open");
        persistence
            .write(&record("resize", "01"))
            .expect("write should succeed");
        persistence
            .write(&record("resize", "02"))
            .expect("write should succeed");

        persistence
            .remove("resize", "01")
            .expect("remove should succeed");
        persistence
            .remove("resize", "ff")
            .expect("removing a missing record is a no-op");

        let remaining = persistence
            .load_records(Some("resize"))
            .expect("scan should succeed");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].unique_id, "02");
    }
}
