use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::config::MaintenanceConfig;
use crate::logging::{LogLevel, Logger};
use crate::orchestrator::functions::FunctionRegistry;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 60_000;

const LOG_CONTEXT: &str = "maintenance::sweeper";

#[derive(Debug)]
pub enum MaintenanceError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    SpawnFailed(std::io::Error),
    JoinFailed,
}

impl fmt::Display for MaintenanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "sweep interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "sweeper is already running"),
            Self::SpawnFailed(source) => write!(f, "failed to spawn sweeper thread: {source}"),
            Self::JoinFailed => write!(f, "sweeper thread join failed"),
        }
    }
}

impl std::error::Error for MaintenanceError {}

/// Periodically reaps functions that no session holds and that carry no work.
pub struct Sweeper {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    registry: FunctionRegistry,
    logger: Arc<Logger>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn new(
        registry: FunctionRegistry,
        logger: Arc<Logger>,
        config: MaintenanceConfig,
    ) -> Result<Self, MaintenanceError> {
        Self::validate_interval(config.sweep_interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.sweep_interval_ms,
            registry,
            logger,
            stop_tx: None,
            worker: None,
        })
    }

    pub fn start(&mut self) -> Result<(), MaintenanceError> {
        if self.worker.is_some() {
            return Err(MaintenanceError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let registry = self.registry.clone();
        let logger = Arc::clone(&self.logger);
        let interval = Duration::from_millis(self.interval_ms);

        let worker = thread::Builder::new()
            .name("jobhop-sweeper".to_owned())
            .spawn(move || {
                // a stop message or a dropped sender both end the loop
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    let reaped = registry.sweep();
                    if reaped > 0 {
                        logger.log(
                            LogLevel::Debug,
                            Some(LOG_CONTEXT),
                            "evicted idle functions",
                            Some(json!({
                                "reaped": reaped,
                                "remaining": registry.len(),
                            })),
                        );
                    }
                }
            })
            .map_err(MaintenanceError::SpawnFailed)?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "sweeper started",
            Some(json!({
                "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                "interval_ms": self.interval_ms,
            })),
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), MaintenanceError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| MaintenanceError::JoinFailed);
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    fn validate_interval(interval_ms: u64) -> Result<(), MaintenanceError> {
        if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            Ok(())
        } else {
            Err(MaintenanceError::InvalidInterval {
                provided_ms: interval_ms,
            })
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
