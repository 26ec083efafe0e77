use crate::buffer::RollCycle;
use crate::reliability::RetryPolicy;
use crate::sender::OtlpOutputConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub enabled: bool,
    pub host: String,
    pub grpc_port: u16,
    pub http_port: Option<u16>,
}

impl ReceiverConfig {
    pub fn grpc_addr(&self) -> Result<SocketAddr, super::ConfigError> {
        socket_addr(&self.host, self.grpc_port)
    }

    pub fn http_addr(&self) -> Result<Option<SocketAddr>, super::ConfigError> {
        self.http_port
            .map(|port| socket_addr(&self.host, port))
            .transpose()
    }
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr, super::ConfigError> {
    let literal = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    literal.parse().map_err(|e| {
        super::ConfigError::InvalidConfig(format!("Invalid listen address '{literal}': {e}"))
    })
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            grpc_port: 4317,
            http_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub path: PathBuf,
    pub roll_cycle: RollCycle,
    pub batch_size: usize,
    #[serde(with = "super::serde_helpers")]
    pub drain_interval: Duration,
    pub max_in_flight_batches: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/telemetry-queue"),
            roll_cycle: RollCycle::Hourly,
            batch_size: 100,
            drain_interval: Duration::from_millis(1000),
            max_in_flight_batches: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub enabled: bool,
    pub output_type: String,
    pub endpoint: String,
    pub max_retries: u32,
    #[serde(with = "super::serde_helpers")]
    pub retry_delay: Duration,
    #[serde(with = "super::serde_helpers")]
    pub timeout: Duration,
}

impl OutputConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: self.retry_delay,
        }
    }

    pub fn otlp(&self) -> OtlpOutputConfig {
        OtlpOutputConfig {
            enabled: self.enabled,
            endpoint: self.endpoint.clone(),
            timeout: self.timeout,
            retry: self.retry_policy(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_type: crate::sender::OTLP_GRPC_OUTPUT.to_string(),
            endpoint: "http://localhost:4317".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(5000),
        }
    }
}
