use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use serde_json::{Value, json};

use jobhop::config::AppConfig;
use jobhop::logging::{LogLevel, Logger};
use jobhop::maintenance::Sweeper;
use jobhop::shutdown::ShutdownSignal;
use jobhop::storage::open_persistence;
use jobhop::{BrokerContext, BrokerSettings, FunctionRegistry, LocalBroker};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

fn main() {
    print_startup_banner();

    let app_config = AppConfig::load_with_discovery(env::args().skip(1)).unwrap_or_else(|error| {
        eprintln!("configuration error: {error}");
        process::exit(2);
    });
    let logger_config = app_config.logger_config().unwrap_or_else(|error| {
        eprintln!("{error}");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let persistence =
        open_persistence(&app_config.persistence, &logger).unwrap_or_else(|error| {
            eprintln!("persistence initialization error: {error}");
            process::exit(2);
        });

    let context = Arc::new(BrokerContext::new(
        Arc::clone(&logger),
        BrokerSettings::from_config(&app_config),
        persistence,
    ));
    let broker = LocalBroker::new(Arc::clone(&context));
    if let Err(error) = broker.registry().restore_persisted() {
        logger.warn(
            Some("main::storage"),
            &format!("persisted jobs could not be restored: {error}"),
        );
    }
    logger.log(
        LogLevel::Info,
        Some("main::broker"),
        &format!(
            "{} v{} broker started",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "broker_id": broker.broker_id(),
            "default_max_queue_depth": app_config.broker.default_max_queue_depth,
            "persistence_enabled": context.persistence().is_some(),
        })),
    );

    let mut sweeper = Sweeper::new(
        broker.registry().clone(),
        Arc::clone(&logger),
        app_config.maintenance,
    )
    .unwrap_or_else(|error| {
        eprintln!("maintenance configuration error: {error}");
        process::exit(2);
    });
    if let Err(error) = sweeper.start() {
        eprintln!("maintenance startup error: {error}");
        process::exit(2);
    }

    let shutdown = ShutdownSignal::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown.wait_timeout(STATUS_INTERVAL) {
        logger.log(
            LogLevel::Info,
            Some("main::status"),
            "broker status",
            Some(json!({
                "clients": broker.client_count(),
                "sessions": session_summaries(&broker),
                "functions": function_statuses(broker.registry()),
            })),
        );
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    if let Err(error) = sweeper.stop() {
        logger.warn(Some("main::shutdown"), &format!("sweeper stop failed: {error}"));
    }
    broker.shutdown();
    if let Some(persistence) = context.persistence() {
        if let Err(error) = persistence.flush() {
            logger.error(
                Some("main::shutdown"),
                &format!("persistence flush failed: {error}"),
            );
        }
    }
    logger.info(Some("main::shutdown"), "Graceful shutdown completed");
}

fn session_summaries(broker: &LocalBroker) -> Value {
    let sessions: Vec<Value> = broker
        .sessions()
        .iter()
        .map(|session| {
            json!({
                "connection_id": session.connection_id(),
                "client_id": session.client_id(),
                "connected_at": session
                    .connected_at()
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                "abilities": session.abilities(),
                "working": session.working_count(),
                "tracked_jobs": session.tracked_job_count(),
            })
        })
        .collect();
    Value::Array(sessions)
}

fn function_statuses(registry: &FunctionRegistry) -> Value {
    let statuses: Vec<Value> = registry
        .names()
        .iter()
        .filter_map(|name| registry.get_if_present(name))
        .map(|function| {
            let status = function.status();
            json!({
                "name": status.name,
                "total": status.total,
                "running": status.running,
                "idle_workers": status.idle_workers,
            })
        })
        .collect();
    Value::Array(statuses)
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;66m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const APP_DESCRIPTION: &str =
        "Embeddable job-queue broker: per-function priority queues, idempotent submission.";

    println!("{BANNER_COLOR}jobhop{RESET}");
    println!(
        "{} v{} | build {} | rev {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("JOBHOP_BUILD_DATE_UTC"),
        env!("JOBHOP_GIT_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}MIT License; provided \"AS IS\", without warranty.{RESET}");
    println!();
}
