use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::AppConfig;
use crate::logging::Logger;
use crate::storage::Persistence;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub broker_id: String,
    pub default_max_queue_depth: usize,
    pub generated_id_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            broker_id: "local".to_owned(),
            default_max_queue_depth: 0,
            generated_id_prefix: "anon-".to_owned(),
        }
    }
}

impl BrokerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            broker_id: config.broker.id.clone(),
            default_max_queue_depth: config.broker.default_max_queue_depth,
            generated_id_prefix: config.broker.generated_id_prefix.clone(),
        }
    }
}

/// Everything a broker instance shares with its functions and sessions.
pub struct BrokerContext {
    logger: Arc<Logger>,
    settings: BrokerSettings,
    persistence: Option<Arc<dyn Persistence>>,
    job_sequence: AtomicU64,
}

impl BrokerContext {
    pub fn new(
        logger: Arc<Logger>,
        settings: BrokerSettings,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            logger,
            settings,
            persistence,
            job_sequence: AtomicU64::new(0),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn persistence(&self) -> Option<&Arc<dyn Persistence>> {
        self.persistence.as_ref()
    }

    /// Broker-unique job handle, `H:<broker-id>:<sequence>`.
    pub fn next_job_handle(&self) -> String {
        let sequence = self.job_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("H:{}:{sequence}", self.settings.broker_id)
    }
}

impl fmt::Debug for BrokerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext")
            .field("settings", &self.settings)
            .field("persistence", &self.persistence.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::logging::Logger;

    use super::{BrokerContext, BrokerSettings};

    #[test]
    fn handles_carry_broker_id_and_increase() {
        let context = BrokerContext::new(
            Arc::new(Logger::silent()),
            BrokerSettings {
                broker_id: "edge-1".to_owned(),
                ..BrokerSettings::default()
            },
            None,
        );

        assert_eq!(context.next_job_handle(), "H:edge-1:1");
        assert_eq!(context.next_job_handle(), "H:edge-1:2");
        assert!(context.persistence().is_none());
    }
}
