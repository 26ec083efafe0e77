pub mod config;
pub mod initialization;
pub mod logging_system;
pub mod scheduler;
pub mod service;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, LogLevel};
pub use initialization::InitializationError;
pub use logging_system::{LoggingSystem, setup_logging};
pub use scheduler::{CollectorScheduler, SchedulerConfig, SchedulerError, SchedulerState, TickOutcome};
pub use service::{ServiceError, ServiceManager};
pub use shutdown::{ShutdownReason, shutdown_signal, wait_for_shutdown};

use clap::Parser;
use std::process;
use tracing::{error, info, warn};

pub struct App {
    service_manager: ServiceManager,
}

impl App {
    pub async fn from_args<I, T>(args: I) -> Result<Self, Box<dyn std::error::Error + Send + Sync>>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let config = Config::from_args_and_env(args)?;
        Self::from_config(config).await
    }

    pub async fn from_config(
        config: Config,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        if let Err(e) = setup_logging(config.log_level, config.log_format) {
            eprintln!("Warning: {e}, continuing with the existing subscriber");
        }

        info!("Starting rask-telemetry-forwarder v{}", get_version());
        info!(
            grpc_port = config.receiver.grpc_port,
            http_port = ?config.receiver.http_port,
            buffer_path = %config.buffer.path.display(),
            batch_size = config.buffer.batch_size,
            flush_interval_ms = config.buffer.drain_interval.as_millis() as u64,
            output = %config.output.output_type,
            endpoint = %config.output.endpoint,
            "Configuration loaded"
        );

        let service_manager = ServiceManager::new(config).await?;
        Ok(Self { service_manager })
    }

    /// Start the service and block until SIGINT/SIGTERM, then shut down.
    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.service_manager.start().await?;
        info!("rask-telemetry-forwarder is running. Press Ctrl+C to stop.");

        let token = self.service_manager.shutdown_token();
        wait_for_shutdown(&token).await;

        match self.service_manager.shutdown().await {
            Ok(()) => {}
            Err(ServiceError::ShutdownTimeout) => {
                warn!("Some deliveries were still in flight at shutdown and will be replayed on restart");
            }
            Err(e) => return Err(e.into()),
        }

        info!("rask-telemetry-forwarder stopped.");
        Ok(())
    }

    pub fn service(&self) -> &ServiceManager {
        &self.service_manager
    }
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Binary entry point.
pub async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 && (args[1] == "--version" || args[1] == "-V") {
        println!("rask-telemetry-forwarder {}", get_version());
        return Ok(());
    }

    if args.len() > 1 && (args[1] == "--help" || args[1] == "-h") {
        Config::parse_from(["rask-telemetry-forwarder", "--help"]);
        return Ok(());
    }

    match App::from_args(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("Application error: {}", e);
                process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            error!("Configuration error: {}", e);
            process::exit(1);
        }
    }

    Ok(())
}
