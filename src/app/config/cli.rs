use super::groups::{BufferConfig, OutputConfig, ReceiverConfig};
use super::serde_helpers::{load_env_path, load_env_path_opt, load_env_string, load_env_var, load_env_var_opt};
use super::{ConfigError, LogFormat, LogLevel};
use crate::buffer::RollCycle;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Accept OTLP export requests
    #[arg(long, env = "RECEIVER_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub receiver_enabled: bool,

    /// Listen address for the receivers
    #[arg(long, env = "RECEIVER_HOST", default_value = "0.0.0.0")]
    pub receiver_host: String,

    /// OTLP gRPC listen port
    #[arg(long, env = "RECEIVER_PORT", default_value = "4317")]
    pub receiver_port: u16,

    /// OTLP HTTP listen port (disabled when unset)
    #[arg(long, env = "HTTP_RECEIVER_PORT")]
    pub http_receiver_port: Option<u16>,

    /// Directory holding the per-class queues
    #[arg(long, env = "BUFFER_PATH", default_value = "./data/telemetry-queue")]
    pub buffer_path: PathBuf,

    /// Segment roll cycle (hourly or daily)
    #[arg(long, env = "ROLL_CYCLE", default_value = "hourly")]
    pub roll_cycle: String,

    /// Maximum records per drained batch
    #[arg(long, env = "BATCH_SIZE", default_value = "100")]
    pub batch_size: usize,

    /// Drain interval in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "1000")]
    pub flush_interval_ms: u64,

    /// Concurrent deliveries allowed per class
    #[arg(long, env = "MAX_IN_FLIGHT_BATCHES", default_value = "4")]
    pub max_in_flight_batches: usize,

    /// Forward drained batches downstream
    #[arg(long, env = "OUTPUT_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub output_enabled: bool,

    /// Output processor type
    #[arg(long, env = "OUTPUT_TYPE", default_value = "otlp-grpc")]
    pub output_type: String,

    /// Downstream OTLP gRPC collector
    #[arg(long, env = "OUTPUT_ENDPOINT", default_value = "http://localhost:4317")]
    pub output_endpoint: String,

    /// Retries after the first attempt for transient failures
    #[arg(long, env = "MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds
    #[arg(long, env = "RETRY_DELAY_MS", default_value = "1000")]
    pub retry_delay_ms: u64,

    /// Timeout of a single export attempt in milliseconds
    #[arg(long, env = "OUTPUT_TIMEOUT_MS", default_value = "5000")]
    pub timeout_ms: u64,

    /// Time allowed for in-flight deliveries on shutdown
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value = "10")]
    pub shutdown_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Configuration file path (optional). Replaces CLI and environment values.
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub receiver: ReceiverConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub buffer: BufferConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub output: OutputConfig,

    #[serde(skip)]
    #[arg(skip)]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            receiver_enabled: true,
            receiver_host: "0.0.0.0".to_string(),
            receiver_port: 4317,
            http_receiver_port: None,
            buffer_path: PathBuf::from("./data/telemetry-queue"),
            roll_cycle: "hourly".to_string(),
            batch_size: 100,
            flush_interval_ms: 1000,
            max_in_flight_batches: 4,
            output_enabled: true,
            output_type: crate::sender::OTLP_GRPC_OUTPUT.to_string(),
            output_endpoint: "http://localhost:4317".to_string(),
            max_retries: 3,
            retry_delay_ms: 1000,
            timeout_ms: 5000,
            shutdown_timeout_secs: 10,
            log_level: LogLevel::Info,
            log_format: LogFormat::Json,
            config_file: None,
            receiver: ReceiverConfig::default(),
            buffer: BufferConfig::default(),
            output: OutputConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::try_parse_from(args)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        load_env_var("RECEIVER_ENABLED", &mut config.receiver_enabled)?;
        load_env_string("RECEIVER_HOST", &mut config.receiver_host);
        load_env_var("RECEIVER_PORT", &mut config.receiver_port)?;
        load_env_var_opt("HTTP_RECEIVER_PORT", &mut config.http_receiver_port)?;
        load_env_path("BUFFER_PATH", &mut config.buffer_path);
        load_env_string("ROLL_CYCLE", &mut config.roll_cycle);
        load_env_var("BATCH_SIZE", &mut config.batch_size)?;
        load_env_var("FLUSH_INTERVAL_MS", &mut config.flush_interval_ms)?;
        load_env_var("MAX_IN_FLIGHT_BATCHES", &mut config.max_in_flight_batches)?;
        load_env_var("OUTPUT_ENABLED", &mut config.output_enabled)?;
        load_env_string("OUTPUT_TYPE", &mut config.output_type);
        load_env_string("OUTPUT_ENDPOINT", &mut config.output_endpoint);
        load_env_var("MAX_RETRIES", &mut config.max_retries)?;
        load_env_var("RETRY_DELAY_MS", &mut config.retry_delay_ms)?;
        load_env_var("OUTPUT_TIMEOUT_MS", &mut config.timeout_ms)?;
        load_env_var("SHUTDOWN_TIMEOUT_SECS", &mut config.shutdown_timeout_secs)?;

        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = LogLevel::from_str(&log_level, true)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {log_level}")))?;
        }
        if let Ok(log_format) = std::env::var("LOG_FORMAT") {
            config.log_format = LogFormat::from_str(&log_format, true).map_err(|_| {
                ConfigError::EnvError(format!(
                    "Invalid LOG_FORMAT: {log_format}. Valid values: json, compact"
                ))
            })?;
        }
        load_env_path_opt("CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// CLI arguments with environment fallbacks. When a config file is named
    /// the file is loaded instead.
    pub fn from_args_and_env<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::try_parse_from(args)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if let Some(path) = config.config_file.clone() {
            return Self::from_file(path);
        }

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file = Some(path.as_ref().to_path_buf());
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Build the grouped settings from the flat fields.
    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);

        self.receiver = ReceiverConfig {
            enabled: self.receiver_enabled,
            host: self.receiver_host.clone(),
            grpc_port: self.receiver_port,
            http_port: self.http_receiver_port,
        };

        self.buffer = BufferConfig {
            path: self.buffer_path.clone(),
            roll_cycle: RollCycle::parse_lenient(&self.roll_cycle),
            batch_size: self.batch_size,
            drain_interval: Duration::from_millis(self.flush_interval_ms),
            max_in_flight_batches: self.max_in_flight_batches,
        };

        self.output = OutputConfig {
            enabled: self.output_enabled,
            output_type: self.output_type.trim().to_ascii_lowercase(),
            endpoint: self.output_endpoint.clone(),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        };

        Ok(())
    }
}
