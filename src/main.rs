mod broker;
mod config;
mod diagnostics;
mod heartbeat;
mod hooks;
mod logging;
mod protocol;
mod shutdown;
mod transport;
mod utils;

use std::sync::Arc;

use serde_json::json;

use broker::{Broker, BrokerSettings};
use config::AppConfig;
use hooks::LifecycleHooks;
use logging::{LogLevel, Logger, LoggerConfig};
use shutdown::ShutdownHooks;
use transport::tcp::{RouterConfig, TcpRouter};
use utils::runtime::{ensure_posix_or_exit, exit_with_error};
use utils::startup_banner::print_startup_banner;

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let (app_config, config_source) = AppConfig::load_with_discovery(std::env::args().skip(1))
        .unwrap_or_else(|error| exit_with_error("configuration error", error));
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            exit_with_error(
                "configuration error",
                format!(
                    "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                    app_config.logging.level
                ),
            )
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({ "source": config_source.to_string() })),
    );

    let settings = BrokerSettings::from_app_config(&app_config)
        .unwrap_or_else(|error| exit_with_error("heartbeat configuration error", error));
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat policy initialized",
        Some(settings.heartbeat.metadata_payload()),
    );

    let router_config = RouterConfig::from(&app_config);
    let router = TcpRouter::bind(&router_config, Arc::clone(&logger))
        .unwrap_or_else(|error| exit_with_error("router startup error", error));
    let bound_addr = router
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| router_config.endpoint());
    logger.log(
        LogLevel::Info,
        Some("main::router"),
        &format!(
            "{} v{} is active at {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            router_config.endpoint()
        ),
        Some(json!({
            "bind_address": bound_addr,
            "max_message_size_bytes": router_config.max_message_size_bytes,
            "verbose": settings.verbose
        })),
    );

    let shutdown_hooks = ShutdownHooks::install()
        .unwrap_or_else(|error| exit_with_error("failed to install shutdown hooks", error));
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let join_logger = Arc::clone(&logger);
    let leave_logger = Arc::clone(&logger);
    let lifecycle = LifecycleHooks::new()
        .on_connection(move |service| {
            join_logger.debug(
                Some("main::hooks"),
                &format!("worker joined service '{service}'"),
            );
            Ok(())
        })
        .on_disconnection(move |service| {
            leave_logger.debug(
                Some("main::hooks"),
                &format!("worker left service '{service}'"),
            );
            Ok(())
        });

    let mut broker = Broker::new(router, settings, Arc::clone(&logger))
        .with_hooks(lifecycle)
        .with_stop_token(shutdown_hooks.token());

    if let Err(error) = broker.run() {
        logger.error(Some("main::broker"), &format!("{error}"));
        exit_with_error("broker error", error);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Final registry state",
        Some(broker.registry_snapshot()),
    );

    let mut router = broker.into_transport();
    router.shutdown_all_connections();
    drop(shutdown_hooks);
    logger.info(Some("main::shutdown"), "Broker stopped and shutdown completed");
}
