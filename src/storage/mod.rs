mod backend;
mod engine;
mod error;
mod path;
mod sled_backend;

pub use backend::{JobRecord, Persistence};
pub use engine::StorageEngine;
pub use error::StorageError;
pub use sled_backend::SledPersistence;

use std::sync::Arc;

use crate::config::PersistenceConfig;
use crate::logging::Logger;

use path::{ensure_data_dir, resolve_data_path};

/// Opens the configured persistence, or returns `None` when persistence is disabled.
pub fn open_persistence(
    config: &PersistenceConfig,
    logger: &Logger,
) -> Result<Option<Arc<dyn Persistence>>, StorageError> {
    if !config.enabled {
        logger.debug(Some("storage"), "persistence disabled");
        return Ok(None);
    }

    let engine =
        StorageEngine::parse(&config.engine).ok_or_else(|| StorageError::UnsupportedEngine {
            engine: config.engine.clone(),
        })?;

    let data_path = resolve_data_path(&config.path)?;
    ensure_data_dir(&data_path)?;

    let persistence: Arc<dyn Persistence> = match engine {
        StorageEngine::Sled => Arc::new(SledPersistence::open(
            &data_path,
            Some(config.cache_capacity),
        )?),
    };

    logger.info(
        Some("storage"),
        &format!(
            "{} persistence opened at {}",
            engine.as_str(),
            data_path.display()
        ),
    );
    Ok(Some(persistence))
}
